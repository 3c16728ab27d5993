use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use coderun_protocol::{ProcessEvent, RequestKey, RunnerError, RunnerResult};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// The event was a halt; the entry is gone.
    Retired,
    /// The entry exists but nobody is listening any more.
    Silenced,
    Unknown,
}

#[derive(Debug)]
struct PendingRequest {
    sink: Option<mpsc::UnboundedSender<ProcessEvent>>,
    dispatched_at: Instant,
    last_activity: Instant,
}

/// Stale entry removed by [`CorrelationTable::evict_stale`].
#[derive(Debug)]
pub struct EvictedRequest {
    pub key: RequestKey,
    pub idle_for: Duration,
    pub sink: Option<mpsc::UnboundedSender<ProcessEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequestSummary {
    pub key: RequestKey,
    pub detached: bool,
    pub age: Duration,
}

/// Client-side map from request key to the stream waiting for its replies.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<RequestKey, PendingRequest>,
}

impl CorrelationTable {
    pub fn register(
        &mut self,
        key: RequestKey,
        sink: mpsc::UnboundedSender<ProcessEvent>,
    ) -> RunnerResult<()> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(RunnerError::Protocol(format!(
                "request key {key} is already awaiting replies"
            ))),
            Entry::Vacant(slot) => {
                let now = Instant::now();
                slot.insert(PendingRequest {
                    sink: Some(sink),
                    dispatched_at: now,
                    last_activity: now,
                });
                Ok(())
            }
        }
    }

    /// Silences `key` without retiring it, so replies still in flight are
    /// swallowed. Returns `false` if the key is not live.
    pub fn detach(&mut self, key: RequestKey) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.sink = None;
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, key: RequestKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn route(&mut self, key: RequestKey, event: ProcessEvent) -> RouteOutcome {
        let halted = event.is_halt();
        let Some(entry) = self.entries.get_mut(&key) else {
            return RouteOutcome::Unknown;
        };
        entry.last_activity = Instant::now();

        let delivered = match entry.sink.as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        };
        if halted {
            self.entries.remove(&key);
            return if delivered {
                RouteOutcome::Retired
            } else {
                RouteOutcome::Silenced
            };
        }
        if delivered {
            RouteOutcome::Delivered
        } else {
            entry.sink = None;
            RouteOutcome::Silenced
        }
    }

    pub fn remove(&mut self, key: RequestKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Removes every entry idle for longer than `timeout` as of `now`.
    pub fn evict_stale(&mut self, timeout: Duration, now: Instant) -> Vec<EvictedRequest> {
        let stale = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) > timeout)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        stale
            .into_iter()
            .filter_map(|key| {
                self.entries.remove(&key).map(|entry| EvictedRequest {
                    key,
                    idle_for: now.saturating_duration_since(entry.last_activity),
                    sink: entry.sink,
                })
            })
            .collect()
    }

    /// Halts and removes every entry, returning the retired keys.
    pub fn halt_all(&mut self, reason: &str) -> Vec<RequestKey> {
        self.entries
            .drain()
            .map(|(key, entry)| {
                if let Some(sink) = entry.sink {
                    let _ = sink.send(ProcessEvent::Halt(reason.to_owned()));
                }
                key
            })
            .collect()
    }

    pub fn contains(&self, key: RequestKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn is_detached(&self, key: RequestKey) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|entry| entry.sink.is_none())
    }

    pub fn summaries(&self) -> Vec<PendingRequestSummary> {
        let mut summaries = self
            .entries
            .iter()
            .map(|(key, entry)| PendingRequestSummary {
                key: *key,
                detached: entry.sink.is_none(),
                age: entry.dispatched_at.elapsed(),
            })
            .collect::<Vec<_>>();
        summaries.sort_by_key(|summary| summary.key);
        summaries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

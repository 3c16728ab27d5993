use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use coderun_protocol::{Language, ProcessEvent};
use tokio::sync::mpsc;

use crate::factory::{ExecutorControls, ExecutorSet};
use crate::sink::EventSink;

pub const DEFAULT_POOL_BUFFER_SIZE: usize = 2;
pub const DEFAULT_REFILL_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessPoolConfig {
    /// Warm slots kept per language.
    pub buffer_size: usize,
    /// Consecutive warm-up failures tolerated in one refill pass.
    pub refill_attempts: usize,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_POOL_BUFFER_SIZE,
            refill_attempts: DEFAULT_REFILL_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessPoolStats {
    pub idle_slots: Vec<(Language, usize)>,
    pub warm_claims_total: u64,
    pub cold_starts_total: u64,
    pub cold_start_failures_total: u64,
    pub refill_failures_total: u64,
    pub discarded_slots_total: u64,
}

#[derive(Debug, Default)]
struct ProcessPoolCounters {
    warm_claims_total: AtomicU64,
    cold_starts_total: AtomicU64,
    cold_start_failures_total: AtomicU64,
    refill_failures_total: AtomicU64,
    discarded_slots_total: AtomicU64,
}

struct PoolSlot {
    controls: ExecutorControls,
    warmed_at: Instant,
}

struct ProcessPoolInner {
    executors: ExecutorSet,
    config: ProcessPoolConfig,
    slots: Mutex<HashMap<Language, VecDeque<PoolSlot>>>,
    refilling: Mutex<HashSet<Language>>,
    counters: ProcessPoolCounters,
}

#[derive(Debug, Default)]
struct RefillPass {
    created: usize,
    gave_up: bool,
}

/// Ring of pre-started executors per language. Claimed slots are one-shot
/// and are replaced in the background.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<ProcessPoolInner>,
}

impl ProcessPool {
    /// Builds the pool and synchronously warms `buffer_size` slots for each
    /// configured language. Process-backed factories need a tokio runtime.
    pub fn new(executors: ExecutorSet, config: ProcessPoolConfig) -> Self {
        let pool = Self {
            inner: Arc::new(ProcessPoolInner {
                executors,
                config,
                slots: Mutex::new(HashMap::new()),
                refilling: Mutex::new(HashSet::new()),
                counters: ProcessPoolCounters::default(),
            }),
        };
        for language in pool.inner.executors.languages() {
            let created = pool.refill(language);
            tracing::debug!(language = %language, created, "warmed executor pool");
        }
        pool
    }

    pub fn config(&self) -> ProcessPoolConfig {
        self.inner.config
    }

    pub fn supports(&self, language: Language) -> bool {
        self.inner.executors.get(language).is_some()
    }

    /// Hands out an executor for `language` wired to `consumer`, warm if one
    /// is parked and cold otherwise. `payload` is forwarded as the code to
    /// run. Never fails: start failures arrive on `consumer` as an error
    /// followed by a halt.
    pub fn pop(
        &self,
        language: Language,
        payload: Option<&str>,
        consumer: mpsc::UnboundedSender<ProcessEvent>,
    ) -> ExecutorControls {
        let controls = match self.take_idle_slot(language) {
            Some(slot) => {
                let replayed = slot.controls.sink().claim(consumer);
                tracing::debug!(
                    language = %language,
                    replayed,
                    idle_for_ms = slot.warmed_at.elapsed().as_millis() as u64,
                    "claimed warm executor"
                );
                if let Some(code) = payload {
                    slot.controls.interact(code);
                }
                self.inner
                    .counters
                    .warm_claims_total
                    .fetch_add(1, Ordering::Relaxed);
                slot.controls
            }
            None => self.cold_start(language, payload, consumer),
        };
        self.schedule_refill(language);
        controls
    }

    /// Tops `language` back up to `buffer_size` idle slots, returning how many
    /// were created.
    pub fn refill(&self, language: Language) -> usize {
        self.refill_pass(language).created
    }

    pub fn idle_slots(&self, language: Language) -> usize {
        self.slots().get(&language).map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> ProcessPoolStats {
        let counters = &self.inner.counters;
        let idle_slots = {
            let slots = self.slots();
            self.inner
                .executors
                .languages()
                .into_iter()
                .map(|language| (language, slots.get(&language).map_or(0, VecDeque::len)))
                .collect()
        };
        ProcessPoolStats {
            idle_slots,
            warm_claims_total: counters.warm_claims_total.load(Ordering::Relaxed),
            cold_starts_total: counters.cold_starts_total.load(Ordering::Relaxed),
            cold_start_failures_total: counters.cold_start_failures_total.load(Ordering::Relaxed),
            refill_failures_total: counters.refill_failures_total.load(Ordering::Relaxed),
            discarded_slots_total: counters.discarded_slots_total.load(Ordering::Relaxed),
        }
    }

    /// Kills every idle slot. Claimed executors are owned by their callers.
    pub fn shutdown(&self) {
        let drained = {
            let mut slots = self.slots();
            slots
                .drain()
                .flat_map(|(_, queue)| queue.into_iter())
                .collect::<Vec<_>>()
        };
        for slot in drained {
            slot.controls.detach();
            slot.controls.kill();
        }
    }

    fn take_idle_slot(&self, language: Language) -> Option<PoolSlot> {
        loop {
            let slot = self.slots().get_mut(&language)?.pop_front()?;
            if !slot.controls.sink().has_buffered_halt() {
                return Some(slot);
            }
            self.inner
                .counters
                .discarded_slots_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(language = %language, "discarding warm executor that exited while idle");
            slot.controls.detach();
            slot.controls.kill();
        }
    }

    fn cold_start(
        &self,
        language: Language,
        payload: Option<&str>,
        consumer: mpsc::UnboundedSender<ProcessEvent>,
    ) -> ExecutorControls {
        let sink = EventSink::live(consumer);
        let Some(factory) = self.inner.executors.get(language) else {
            let message = format!("no executor configured for {language}");
            tracing::warn!(language = %language, "request for unconfigured language");
            sink.error(format!("{message}\n"));
            sink.halt(message);
            return ExecutorControls::inert(sink);
        };

        self.inner
            .counters
            .cold_starts_total
            .fetch_add(1, Ordering::Relaxed);
        match factory.start(payload, sink.clone()) {
            Ok(control) => ExecutorControls::new(control, sink),
            Err(error) => {
                self.inner
                    .counters
                    .cold_start_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(language = %language, error = %error, "cold start failed");
                sink.error(format!("{error}\n"));
                sink.halt(error.to_string());
                ExecutorControls::inert(sink)
            }
        }
    }

    fn schedule_refill(&self, language: Language) {
        if self.inner.config.buffer_size == 0 || !self.supports(language) {
            return;
        }
        if !self.refilling().insert(language) {
            return;
        }

        let pool = self.clone();
        let refill = move || pool.run_refill_passes(language);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { refill() });
            }
            Err(_) => refill(),
        }
    }

    /// Repeats refill passes for a language whose refill flag is held until
    /// the pool is full or a pass gives up. The final check and the flag
    /// release happen under the refill lock, so a pop that lands after the
    /// last pass either is seen by the check or schedules a fresh pass.
    fn run_refill_passes(&self, language: Language) {
        let mut created = 0;
        loop {
            let pass = self.refill_pass(language);
            created += pass.created;
            let mut refilling = self.refilling();
            if pass.gave_up || self.missing_slots(language) == 0 {
                refilling.remove(&language);
                break;
            }
        }
        tracing::debug!(language = %language, created, "refilled executor pool");
    }

    fn refill_pass(&self, language: Language) -> RefillPass {
        let mut pass = RefillPass::default();
        let Some(factory) = self.inner.executors.get(language) else {
            return pass;
        };
        let mut failures = 0;
        while self.missing_slots(language) > 0 {
            let sink = EventSink::buffering();
            match factory.start(None, sink.clone()) {
                Ok(control) => {
                    let slot = PoolSlot {
                        controls: ExecutorControls::new(control, sink),
                        warmed_at: Instant::now(),
                    };
                    self.slots().entry(language).or_default().push_back(slot);
                    pass.created += 1;
                    failures = 0;
                }
                Err(error) => {
                    failures += 1;
                    self.inner
                        .counters
                        .refill_failures_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        language = %language,
                        attempt = failures,
                        error = %error,
                        "failed to warm executor; slot dropped"
                    );
                    if failures >= self.inner.config.refill_attempts.max(1) {
                        pass.gave_up = true;
                        break;
                    }
                }
            }
        }
        pass
    }

    fn missing_slots(&self, language: Language) -> usize {
        self.inner
            .config
            .buffer_size
            .saturating_sub(self.idle_slots(language))
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<Language, VecDeque<PoolSlot>>> {
        self.inner
            .slots
            .lock()
            .expect("process pool slot lock poisoned")
    }

    fn refilling(&self) -> std::sync::MutexGuard<'_, HashSet<Language>> {
        self.inner
            .refilling
            .lock()
            .expect("process pool refill lock poisoned")
    }
}

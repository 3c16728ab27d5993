use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coderun_channel::SharedEnvelopeSender;
use coderun_protocol::{
    Envelope, KeyAllocator, Language, Message, ProcessEvent, ProcessEventStream, RequestKey,
};
use tokio::sync::mpsc;

use crate::table::CorrelationTable;

pub(crate) type SharedTable = Arc<Mutex<CorrelationTable>>;

pub(crate) fn lock_table(table: &Mutex<CorrelationTable>) -> std::sync::MutexGuard<'_, CorrelationTable> {
    table.lock().expect("correlation table lock poisoned")
}

/// Allocates keys, records the reply stream and forwards envelopes to the
/// executor host.
#[derive(Clone)]
pub struct Dispatcher {
    outbound: SharedEnvelopeSender,
    keys: Arc<dyn KeyAllocator>,
    table: SharedTable,
}

impl Dispatcher {
    pub(crate) fn new(
        outbound: SharedEnvelopeSender,
        keys: Arc<dyn KeyAllocator>,
        table: SharedTable,
    ) -> Self {
        Self {
            outbound,
            keys,
            table,
        }
    }

    /// Sends `message` under a fresh key. Never fails: a transport error
    /// shows up as a halt on the returned stream.
    pub fn dispatch(&self, handler: Option<Language>, message: Message) -> DispatchedRequest {
        let key = self.keys.allocate();
        let (sink, receiver) = mpsc::unbounded_channel();
        // Registered before sending so a fast reply always finds its entry.
        let registered = lock_table(&self.table).register(key, sink.clone());
        if let Err(error) = registered {
            tracing::warn!(key = %key, error = %error, "refusing to dispatch under a live key");
            let _ = sink.send(ProcessEvent::Halt(error.to_string()));
            return self.request(key, receiver);
        }

        if let Err(error) = self.outbound.send(Envelope::new(key, handler, message)) {
            tracing::warn!(key = %key, error = %error, "failed to deliver request");
            lock_table(&self.table).remove(key);
            let _ = sink.send(ProcessEvent::Halt(format!(
                "request could not be delivered: {error}"
            )));
        }
        self.request(key, receiver)
    }

    pub fn run_code(&self, language: Language, code: impl Into<String>) -> DispatchedRequest {
        self.dispatch(Some(language), Message::RunCode { code: code.into() })
    }

    fn request(
        &self,
        key: RequestKey,
        receiver: mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> DispatchedRequest {
        DispatchedRequest {
            key,
            controls: RequestControls {
                key,
                outbound: Arc::clone(&self.outbound),
                table: Arc::clone(&self.table),
            },
            events: RequestEvents { receiver },
        }
    }
}

/// A dispatched request: its key, the controls, and the reply stream.
#[derive(Debug)]
pub struct DispatchedRequest {
    pub key: RequestKey,
    pub controls: RequestControls,
    pub events: RequestEvents,
}

impl DispatchedRequest {
    pub fn into_parts(self) -> (RequestControls, RequestEvents) {
        (self.controls, self.events)
    }
}

/// Fire-and-forget handles for a dispatched request. All of them are safe
/// to call after the request halted.
#[derive(Clone)]
pub struct RequestControls {
    key: RequestKey,
    outbound: SharedEnvelopeSender,
    table: SharedTable,
}

impl std::fmt::Debug for RequestControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestControls")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RequestControls {
    pub fn key(&self) -> RequestKey {
        self.key
    }

    pub fn interact(&self, line: impl Into<String>) {
        lock_table(&self.table).touch(self.key);
        if let Err(error) = self.outbound.send(Envelope::interact(self.key, line)) {
            tracing::debug!(key = %self.key, error = %error, "dropping input for undeliverable request");
        }
    }

    /// Requests termination. The stream stays open until the executor
    /// reports the halt.
    pub fn kill(&self) {
        if let Err(error) = self.outbound.send(Envelope::kill(self.key)) {
            tracing::debug!(key = %self.key, error = %error, "dropping kill for undeliverable request");
        }
    }

    /// Stops delivery to the event stream. The process keeps running.
    pub fn detach(&self) {
        if !lock_table(&self.table).detach(self.key) {
            tracing::debug!(key = %self.key, "detach for request that already halted");
        }
    }
}

/// Reply stream for one request. Ends after the halt, or when detached.
#[derive(Debug)]
pub struct RequestEvents {
    receiver: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl RequestEvents {
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProcessEvent> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
impl ProcessEventStream for RequestEvents {
    async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.recv().await
    }
}

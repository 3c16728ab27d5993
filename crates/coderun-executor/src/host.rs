use std::sync::{Arc, Mutex};

use coderun_channel::{EnvelopeReceiver, SharedEnvelopeSender};
use coderun_protocol::{Envelope, Language, Message, ProcessEvent, RequestKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::ProcessPool;
use crate::registry::{InteractOutcome, ProcessRegistry};

/// Executor side of the channel: starts processes for `RUN_CODE`, routes
/// input and kills by key, and streams every process event back as a reply
/// envelope.
#[derive(Clone)]
pub struct ExecutorHost {
    outbound: SharedEnvelopeSender,
    registry: Arc<Mutex<ProcessRegistry>>,
    pool: ProcessPool,
}

impl ExecutorHost {
    pub fn new(outbound: SharedEnvelopeSender, pool: ProcessPool) -> Self {
        Self {
            outbound,
            registry: Arc::new(Mutex::new(ProcessRegistry::default())),
            pool,
        }
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    pub fn live_requests(&self) -> usize {
        self.registry().len()
    }

    /// Consumes `inbound` until the peer goes away, then kills every live
    /// process and shuts the pool down.
    pub fn spawn(self, inbound: EnvelopeReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }

    pub async fn run(self, mut inbound: EnvelopeReceiver) {
        while let Some(envelope) = inbound.recv().await {
            self.handle_envelope(envelope);
        }
        tracing::info!("executor host channel closed; shutting down");
        self.shutdown();
    }

    /// Must be called from within a tokio runtime.
    pub fn handle_envelope(&self, envelope: Envelope) {
        let Envelope {
            key,
            handler,
            message,
        } = envelope;
        match message {
            Message::RunCode { code } => match handler {
                Some(language) => self.run_code(key, language, &code),
                None => self.reject(key, "RUN_CODE envelope is missing a handler"),
            },
            Message::InteractProcess { line } => {
                if self.registry().interact(key, line) == InteractOutcome::Buffered {
                    tracing::debug!(key = %key, "buffered input for request without a process");
                }
            }
            Message::KillProcess => {
                self.registry().kill(key);
            }
            reply => {
                tracing::debug!(key = %key, kind = reply.tag(), "ignoring reply envelope sent to executor host");
            }
        }
    }

    pub fn shutdown(&self) {
        let drained = self.registry().drain();
        for (key, controls) in drained {
            tracing::debug!(key = %key, "killing process on host shutdown");
            controls.detach();
            controls.kill();
        }
        self.pool.shutdown();
    }

    fn run_code(&self, key: RequestKey, language: Language, code: &str) {
        {
            let registry = self.registry();
            if registry.contains(key) || registry.is_retired(key) {
                tracing::warn!(key = %key, language = %language, "ignoring RUN_CODE for a key that is already in use");
                return;
            }
        }

        let (consumer, events) = mpsc::unbounded_channel();
        let controls = self.pool.pop(language, Some(code), consumer);
        if let Err(error) = self.registry().register(key, controls) {
            tracing::warn!(key = %key, error = %error, "failed to register process");
            return;
        }
        tracing::debug!(key = %key, language = %language, "started process for request");
        self.spawn_forwarder(key, events);
    }

    fn spawn_forwarder(&self, key: RequestKey, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        let outbound = Arc::clone(&self.outbound);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let halted = event.is_halt();
                if let Err(error) = outbound.send(Envelope::reply(key, event)) {
                    tracing::warn!(key = %key, error = %error, "failed to deliver reply; killing process");
                    let removed = lock_registry(&registry).remove(key);
                    if let Some(controls) = removed {
                        controls.detach();
                        controls.kill();
                    }
                    return;
                }
                if halted {
                    lock_registry(&registry).remove(key);
                    return;
                }
            }
            lock_registry(&registry).remove(key);
        });
    }

    fn reject(&self, key: RequestKey, reason: &str) {
        tracing::warn!(key = %key, reason, "rejecting request");
        for event in [
            ProcessEvent::Error(format!("{reason}\n")),
            ProcessEvent::Halt(reason.to_owned()),
        ] {
            if let Err(error) = self.outbound.send(Envelope::reply(key, event)) {
                tracing::warn!(key = %key, error = %error, "failed to deliver rejection");
                break;
            }
        }
        self.registry().remove(key);
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, ProcessRegistry> {
        lock_registry(&self.registry)
    }
}

fn lock_registry(registry: &Mutex<ProcessRegistry>) -> std::sync::MutexGuard<'_, ProcessRegistry> {
    registry.lock().expect("process registry lock poisoned")
}

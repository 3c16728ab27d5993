
use coderun_channel::EnvelopeReceiver;
use coderun_protocol::Envelope;
use tokio::task::JoinHandle;

use crate::dispatcher::{lock_table, SharedTable};
use crate::table::RouteOutcome;

pub const CHANNEL_CLOSED_MESSAGE: &str = "channel closed";

/// The single consumer of the client's inbound envelopes.
#[derive(Clone)]
pub struct InboundRouter {
    table: SharedTable,
}

impl InboundRouter {
    pub(crate) fn new(table: SharedTable) -> Self {
        Self { table }
    }

    /// Routes until the channel closes, then halts every outstanding request.
    pub fn spawn(self, mut inbound: EnvelopeReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                self.route(envelope);
            }
            let retired = lock_table(&self.table).halt_all(CHANNEL_CLOSED_MESSAGE);
            tracing::info!(outstanding = retired.len(), "client channel closed");
        })
    }

    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        let key = envelope.key;
        let tag = envelope.message.tag();
        let Some(event) = envelope.message.into_event() else {
            tracing::debug!(key = %key, kind = tag, "ignoring control envelope sent to client");
            return RouteOutcome::Unknown;
        };

        let outcome = lock_table(&self.table).route(key, event);
        if outcome == RouteOutcome::Unknown {
            tracing::debug!(key = %key, kind = tag, "dropping reply for retired request");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use coderun_protocol::{Envelope, ProcessEvent, RequestKey};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::{InboundRouter, CHANNEL_CLOSED_MESSAGE};
    use crate::table::{CorrelationTable, RouteOutcome};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn replies_reach_only_their_own_request() {
        let table = Arc::new(Mutex::new(CorrelationTable::default()));
        let (first, mut first_events) = mpsc::unbounded_channel();
        let (second, mut second_events) = mpsc::unbounded_channel();
        {
            let mut table = table.lock().expect("table");
            table.register(RequestKey::new(1), first).expect("first");
            table.register(RequestKey::new(2), second).expect("second");
        }
        let router = InboundRouter::new(Arc::clone(&table));

        router.route(Envelope::reply(
            RequestKey::new(2),
            ProcessEvent::Output("two\n".to_owned()),
        ));
        router.route(Envelope::reply(
            RequestKey::new(1),
            ProcessEvent::Output("one\n".to_owned()),
        ));

        assert_eq!(
            first_events.try_recv().expect("first output"),
            ProcessEvent::Output("one\n".to_owned())
        );
        assert_eq!(
            second_events.try_recv().expect("second output"),
            ProcessEvent::Output("two\n".to_owned())
        );
        assert!(first_events.try_recv().is_err());
    }

    #[test]
    fn late_exit_and_control_envelopes_are_ignored() {
        let table = Arc::new(Mutex::new(CorrelationTable::default()));
        let router = InboundRouter::new(table);

        assert_eq!(
            router.route(Envelope::reply(
                RequestKey::new(9),
                ProcessEvent::Halt("late".to_owned())
            )),
            RouteOutcome::Unknown
        );
        assert_eq!(
            router.route(Envelope::kill(RequestKey::new(9))),
            RouteOutcome::Unknown
        );
    }

    #[tokio::test]
    async fn closing_the_channel_halts_outstanding_requests() {
        let table = Arc::new(Mutex::new(CorrelationTable::default()));
        let (sink, mut events) = mpsc::unbounded_channel();
        table
            .lock()
            .expect("table")
            .register(RequestKey::new(4), sink)
            .expect("register");
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let task = InboundRouter::new(Arc::clone(&table)).spawn(inbound_rx);

        drop(inbound_tx);
        timeout(TEST_TIMEOUT, task)
            .await
            .expect("router should stop")
            .expect("router panicked");

        assert_eq!(
            events.recv().await,
            Some(ProcessEvent::Halt(CHANNEL_CLOSED_MESSAGE.to_owned()))
        );
        assert_eq!(events.recv().await, None);
        assert!(table.lock().expect("table").is_empty());
    }
}

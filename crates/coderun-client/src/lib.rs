//! Client side of coderun: dispatches requests over a channel endpoint and
//! turns the replies into one event stream per request.

pub mod completion;
pub mod dispatcher;
pub mod router;
pub mod table;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coderun_channel::{ChannelEndpoint, SharedEnvelopeSender};
use coderun_protocol::{Envelope, KeyAllocator, Language, ProcessEvent};
use tokio::task::JoinHandle;

pub use completion::{collect, wait_for_completion, CompletionError, RunTranscript};
pub use dispatcher::{DispatchedRequest, Dispatcher, RequestControls, RequestEvents};
pub use router::{InboundRouter, CHANNEL_CLOSED_MESSAGE};
pub use table::{CorrelationTable, PendingRequestSummary, RouteOutcome};

use crate::dispatcher::{lock_table, SharedTable};

pub const DEFAULT_HALT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
pub const CLIENT_DROPPED_MESSAGE: &str = "client dropped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerClientConfig {
    /// Requests silent for this long are halted and killed. `None` disables
    /// the watchdog.
    pub halt_timeout: Option<Duration>,
    pub watchdog_interval: Duration,
}

impl Default for RunnerClientConfig {
    fn default() -> Self {
        Self {
            halt_timeout: Some(DEFAULT_HALT_TIMEOUT),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
        }
    }
}

pub struct RunnerClient {
    dispatcher: Dispatcher,
    outbound: SharedEnvelopeSender,
    table: SharedTable,
    router_task: JoinHandle<()>,
    watchdog_task: Option<JoinHandle<()>>,
}

impl RunnerClient {
    /// Must be called from within a tokio runtime.
    pub fn start(
        endpoint: ChannelEndpoint,
        keys: Arc<dyn KeyAllocator>,
        config: RunnerClientConfig,
    ) -> Self {
        let (outbound, inbound) = endpoint.into_parts();
        let table: SharedTable = Arc::new(Mutex::new(CorrelationTable::default()));
        let dispatcher = Dispatcher::new(Arc::clone(&outbound), keys, Arc::clone(&table));
        let router_task = InboundRouter::new(Arc::clone(&table)).spawn(inbound);
        let watchdog_task = config.halt_timeout.map(|halt_timeout| {
            spawn_watchdog(
                Arc::clone(&table),
                Arc::clone(&outbound),
                halt_timeout,
                config.watchdog_interval,
            )
        });
        tracing::info!(
            halt_timeout_secs = config.halt_timeout.map(|timeout| timeout.as_secs()),
            "runner client started"
        );
        Self {
            dispatcher,
            outbound,
            table,
            router_task,
            watchdog_task,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn run_code(&self, language: Language, code: impl Into<String>) -> DispatchedRequest {
        self.dispatcher.run_code(language, code)
    }

    pub fn pending_requests(&self) -> Vec<PendingRequestSummary> {
        lock_table(&self.table).summaries()
    }
}

impl Drop for RunnerClient {
    /// Outstanding requests end with a halt here; nothing else is left to
    /// deliver one once the router and watchdog are gone.
    fn drop(&mut self) {
        self.router_task.abort();
        if let Some(task) = self.watchdog_task.take() {
            task.abort();
        }
        let halted = lock_table(&self.table).halt_all(CLIENT_DROPPED_MESSAGE);
        for key in &halted {
            if let Err(error) = self.outbound.send(Envelope::kill(*key)) {
                tracing::debug!(key = %key, error = %error, "failed to send kill on client drop");
            }
        }
        if !halted.is_empty() {
            tracing::debug!(halted = halted.len(), "runner client dropped with requests in flight");
        }
    }
}

fn spawn_watchdog(
    table: SharedTable,
    outbound: SharedEnvelopeSender,
    halt_timeout: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = lock_table(&table).evict_stale(halt_timeout, Instant::now());
            for request in evicted {
                tracing::warn!(
                    key = %request.key,
                    idle_ms = request.idle_for.as_millis() as u64,
                    "request produced no EXIT in time; halting"
                );
                if let Some(sink) = request.sink {
                    let _ = sink.send(ProcessEvent::Halt(format!(
                        "no EXIT received within {}s",
                        halt_timeout.as_secs_f64()
                    )));
                }
                if let Err(error) = outbound.send(Envelope::kill(request.key)) {
                    tracing::debug!(key = %request.key, error = %error, "failed to send kill for stale request");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use coderun_channel::in_process_pair;
    use coderun_protocol::{
        Envelope, Language, LocalKeyAllocator, Message, ProcessEvent, RequestKey,
    };
    use tokio::time::timeout;

    use super::{
        wait_for_completion, RunnerClient, RunnerClientConfig, CHANNEL_CLOSED_MESSAGE,
        CLIENT_DROPPED_MESSAGE,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    fn config_without_watchdog() -> RunnerClientConfig {
        RunnerClientConfig {
            halt_timeout: None,
            ..RunnerClientConfig::default()
        }
    }

    #[tokio::test]
    async fn replies_from_the_host_complete_the_request() {
        let (client_end, host_end) = in_process_pair();
        let (host_tx, mut host_rx) = host_end.into_parts();
        let client = RunnerClient::start(
            client_end,
            Arc::new(LocalKeyAllocator::new()),
            config_without_watchdog(),
        );

        let mut request = client.run_code(Language::Python, "print(1)");
        let sent = timeout(TEST_TIMEOUT, host_rx.recv())
            .await
            .expect("request timeout")
            .expect("request envelope");
        assert_eq!(sent.handler, Some(Language::Python));

        host_tx
            .send(Envelope::reply(sent.key, ProcessEvent::Output("1\n".to_owned())))
            .expect("send output");
        host_tx
            .send(Envelope::reply(
                sent.key,
                ProcessEvent::Halt("process exited with code 0".to_owned()),
            ))
            .expect("send exit");
        host_tx
            .send(Envelope::reply(sent.key, ProcessEvent::Halt("duplicate".to_owned())))
            .expect("send duplicate exit");

        let transcript = timeout(TEST_TIMEOUT, wait_for_completion(&mut request.events))
            .await
            .expect("completion timeout")
            .expect("clean run");
        assert_eq!(transcript.stdout, "1\n");
        assert_eq!(transcript.exit.as_deref(), Some("process exited with code 0"));
        assert!(client.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn detached_request_receives_nothing_further() {
        let (client_end, host_end) = in_process_pair();
        let (host_tx, _host_rx) = host_end.into_parts();
        let client = RunnerClient::start(
            client_end,
            Arc::new(LocalKeyAllocator::new()),
            config_without_watchdog(),
        );

        let mut request = client.run_code(Language::Scheme, "(display 1)");
        request.controls.detach();
        host_tx
            .send(Envelope::reply(request.key, ProcessEvent::Output("1".to_owned())))
            .expect("send output");

        assert_eq!(
            timeout(TEST_TIMEOUT, request.events.recv())
                .await
                .expect("stream should end"),
            None
        );
        let pending = client.pending_requests();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].detached);
        request.controls.detach();
    }

    #[tokio::test]
    async fn watchdog_halts_silent_requests_and_kills_them() {
        let (client_end, host_end) = in_process_pair();
        let (_host_tx, mut host_rx) = host_end.into_parts();
        let client = RunnerClient::start(
            client_end,
            Arc::new(LocalKeyAllocator::new()),
            RunnerClientConfig {
                halt_timeout: Some(Duration::from_millis(50)),
                watchdog_interval: Duration::from_millis(10),
            },
        );

        let mut request = client.run_code(Language::Sql, "select 1;");

        let halt = timeout(TEST_TIMEOUT, request.events.recv())
            .await
            .expect("watchdog timeout")
            .expect("halt event");
        assert!(matches!(halt, ProcessEvent::Halt(message) if message.starts_with("no EXIT received")));

        let mut saw_kill = false;
        while let Ok(Some(envelope)) = timeout(TEST_TIMEOUT, host_rx.recv()).await {
            if envelope.message == Message::KillProcess {
                assert_eq!(envelope.key, RequestKey::new(1));
                saw_kill = true;
                break;
            }
        }
        assert!(saw_kill);
        assert!(client.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn host_disconnect_halts_outstanding_requests() {
        let (client_end, host_end) = in_process_pair();
        let client = RunnerClient::start(
            client_end,
            Arc::new(LocalKeyAllocator::new()),
            config_without_watchdog(),
        );
        let mut request = client.run_code(Language::Lark, "start: WORD");

        drop(host_end);

        assert_eq!(
            timeout(TEST_TIMEOUT, request.events.recv())
                .await
                .expect("halt timeout"),
            Some(ProcessEvent::Halt(CHANNEL_CLOSED_MESSAGE.to_owned()))
        );
    }

    #[tokio::test]
    async fn dropping_the_client_halts_and_kills_outstanding_requests() {
        let (client_end, host_end) = in_process_pair();
        let (_host_tx, mut host_rx) = host_end.into_parts();
        let client = RunnerClient::start(
            client_end,
            Arc::new(LocalKeyAllocator::new()),
            config_without_watchdog(),
        );
        let mut request = client.run_code(Language::Python, "print(1)");
        let controls = request.controls.clone();

        drop(client);

        assert_eq!(
            timeout(TEST_TIMEOUT, request.events.recv())
                .await
                .expect("halt timeout"),
            Some(ProcessEvent::Halt(CLIENT_DROPPED_MESSAGE.to_owned()))
        );
        assert_eq!(
            timeout(TEST_TIMEOUT, request.events.recv())
                .await
                .expect("stream should end"),
            None
        );

        let mut saw_kill = false;
        while let Ok(Some(envelope)) = timeout(TEST_TIMEOUT, host_rx.recv()).await {
            if envelope.message == Message::KillProcess {
                assert_eq!(envelope.key, request.key);
                saw_kill = true;
                break;
            }
        }
        assert!(saw_kill);
        drop(controls);
    }
}

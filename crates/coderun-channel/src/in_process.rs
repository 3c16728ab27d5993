use std::sync::Arc;

use coderun_protocol::{Envelope, RunnerError, RunnerResult};
use tokio::sync::mpsc;

use crate::adapter::{ChannelEndpoint, EnvelopeSender};

#[derive(Debug, Clone)]
pub struct InProcessSender {
    peer: mpsc::UnboundedSender<Envelope>,
    peer_label: &'static str,
}

impl EnvelopeSender for InProcessSender {
    fn send(&self, envelope: Envelope) -> RunnerResult<()> {
        self.peer.send(envelope).map_err(|rejected| {
            RunnerError::ChannelClosed(format!(
                "{} endpoint dropped before {} envelope for key {}",
                self.peer_label,
                rejected.0.message.tag(),
                rejected.0.key
            ))
        })
    }
}

/// Builds the in-page shim: two endpoints wired back to back, returned as
/// `(client, host)`.
pub fn in_process_pair() -> (ChannelEndpoint, ChannelEndpoint) {
    let (to_host, host_inbound) = mpsc::unbounded_channel();
    let (to_client, client_inbound) = mpsc::unbounded_channel();

    let client = ChannelEndpoint::new(
        Arc::new(InProcessSender {
            peer: to_host,
            peer_label: "executor host",
        }),
        client_inbound,
    );
    let host = ChannelEndpoint::new(
        Arc::new(InProcessSender {
            peer: to_client,
            peer_label: "client",
        }),
        host_inbound,
    );
    (client, host)
}

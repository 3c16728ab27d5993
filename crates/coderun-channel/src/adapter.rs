use std::fmt;
use std::sync::Arc;

use coderun_protocol::{Envelope, RunnerResult};
use tokio::sync::mpsc;

/// Outbound half of a channel adapter. `send` never blocks; an `Err` means
/// the far side is gone and the envelope was dropped.
pub trait EnvelopeSender: Send + Sync + fmt::Debug {
    fn send(&self, envelope: Envelope) -> RunnerResult<()>;
}

pub type SharedEnvelopeSender = Arc<dyn EnvelopeSender>;

pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// One side of a duplex envelope channel.
#[derive(Debug)]
pub struct ChannelEndpoint {
    sender: SharedEnvelopeSender,
    receiver: EnvelopeReceiver,
}

impl ChannelEndpoint {
    pub fn new(sender: SharedEnvelopeSender, receiver: EnvelopeReceiver) -> Self {
        Self { sender, receiver }
    }

    pub fn sender(&self) -> SharedEnvelopeSender {
        Arc::clone(&self.sender)
    }

    pub fn into_parts(self) -> (SharedEnvelopeSender, EnvelopeReceiver) {
        (self.sender, self.receiver)
    }
}

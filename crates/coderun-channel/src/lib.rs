//! Channel adapters: the uniform send/receive surface over which the
//! client and the executor host exchange envelopes.

pub mod adapter;
pub mod in_process;
pub mod line;

pub use adapter::{ChannelEndpoint, EnvelopeReceiver, EnvelopeSender, SharedEnvelopeSender};
pub use in_process::{in_process_pair, InProcessSender};
pub use line::{decode_envelope, encode_envelope, line_endpoint, LineSender};

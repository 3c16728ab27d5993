//! Wire protocol shared by the coderun client and executor host.
//!
//! Both sides exchange [`Envelope`]s tagged with a [`RequestKey`]; replies are
//! surfaced to consumers as [`ProcessEvent`]s.

pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod language;

pub use envelope::{Envelope, Message};
pub use error::{RunnerError, RunnerResult};
pub use event::{BoxedProcessEventStream, ProcessEvent, ProcessEventStream};
pub use ids::{KeyAllocator, LocalKeyAllocator, RequestKey, SharedKeyAllocator};
pub use language::Language;

//! Executor host for coderun: starts interpreter processes on request, keeps
//! a warm pool of them, and routes their events back over the channel.

pub mod factory;
pub mod host;
pub mod pool;
pub mod process;
pub mod registry;
pub mod sink;
pub mod test_support;

pub use factory::{ExecutorControl, ExecutorControls, ExecutorFactory, ExecutorSet};
pub use host::ExecutorHost;
pub use pool::{
    ProcessPool, ProcessPoolConfig, ProcessPoolStats, DEFAULT_POOL_BUFFER_SIZE,
    DEFAULT_REFILL_ATTEMPTS,
};
pub use process::{PayloadFraming, ProcessExecutorConfig, ProcessExecutorFactory};
pub use registry::{InteractOutcome, ProcessRegistry, DEFAULT_RETIRED_KEY_WINDOW};
pub use sink::EventSink;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One step of a request's lifecycle as seen by whoever consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessEvent {
    Output(String),
    Error(String),
    Halt(String),
}

impl ProcessEvent {
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }
}

#[async_trait]
pub trait ProcessEventStream: Send {
    /// Yields `None` once the producer side has gone away.
    async fn next_event(&mut self) -> Option<ProcessEvent>;
}

pub type BoxedProcessEventStream = Box<dyn ProcessEventStream>;

use serde::{Deserialize, Serialize};

use crate::event::ProcessEvent;
use crate::ids::RequestKey;
use crate::language::Language;

/// Unit exchanged over the channel. On the wire the message fields are
/// flattened next to `key` and `handler`, e.g.
/// `{"key":3,"handler":"PYTHON","type":"RUN_CODE","code":"print(1)"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: RequestKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<Language>,
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Out { data: String },
    Err { data: String },
    Exit { message: String },
    RunCode { code: String },
    InteractProcess { line: String },
    KillProcess,
}

impl Message {
    /// Executor-to-client messages.
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Out { .. } | Self::Err { .. } | Self::Exit { .. })
    }

    pub fn into_event(self) -> Option<ProcessEvent> {
        match self {
            Self::Out { data } => Some(ProcessEvent::Output(data)),
            Self::Err { data } => Some(ProcessEvent::Error(data)),
            Self::Exit { message } => Some(ProcessEvent::Halt(message)),
            Self::RunCode { .. } | Self::InteractProcess { .. } | Self::KillProcess => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Out { .. } => "OUT",
            Self::Err { .. } => "ERR",
            Self::Exit { .. } => "EXIT",
            Self::RunCode { .. } => "RUN_CODE",
            Self::InteractProcess { .. } => "INTERACT_PROCESS",
            Self::KillProcess => "KILL_PROCESS",
        }
    }
}

impl From<ProcessEvent> for Message {
    fn from(event: ProcessEvent) -> Self {
        match event {
            ProcessEvent::Output(data) => Self::Out { data },
            ProcessEvent::Error(data) => Self::Err { data },
            ProcessEvent::Halt(message) => Self::Exit { message },
        }
    }
}

impl Envelope {
    pub fn new(key: RequestKey, handler: Option<Language>, message: Message) -> Self {
        Self {
            key,
            handler,
            message,
        }
    }

    pub fn run_code(key: RequestKey, language: Language, code: impl Into<String>) -> Self {
        Self::new(key, Some(language), Message::RunCode { code: code.into() })
    }

    pub fn interact(key: RequestKey, line: impl Into<String>) -> Self {
        Self::new(key, None, Message::InteractProcess { line: line.into() })
    }

    pub fn kill(key: RequestKey) -> Self {
        Self::new(key, None, Message::KillProcess)
    }

    pub fn reply(key: RequestKey, event: ProcessEvent) -> Self {
        Self::new(key, None, event.into())
    }
}

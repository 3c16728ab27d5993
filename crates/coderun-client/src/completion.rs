use coderun_protocol::{ProcessEvent, ProcessEventStream};
use thiserror::Error;

/// Everything a request produced, in arrival order per stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunTranscript {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the stream ended without a halt.
    pub exit: Option<String>,
}

impl RunTranscript {
    pub fn halted(&self) -> bool {
        self.exit.is_some()
    }

    pub fn reported_errors(&self) -> bool {
        !self.stderr.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("run reported error output: {}", .transcript.stderr.trim_end())]
    Failed { transcript: RunTranscript },
    #[error("run ended without an exit message")]
    Disconnected { transcript: RunTranscript },
}

impl CompletionError {
    pub fn transcript(&self) -> &RunTranscript {
        match self {
            Self::Failed { transcript } | Self::Disconnected { transcript } => transcript,
        }
    }
}

/// Drains `events` until the halt or the end of the stream.
pub async fn collect<S>(events: &mut S) -> RunTranscript
where
    S: ProcessEventStream + ?Sized,
{
    let mut transcript = RunTranscript::default();
    while let Some(event) = events.next_event().await {
        match event {
            ProcessEvent::Output(data) => transcript.stdout.push_str(&data),
            ProcessEvent::Error(data) => transcript.stderr.push_str(&data),
            ProcessEvent::Halt(message) => {
                transcript.exit = Some(message);
                break;
            }
        }
    }
    transcript
}

/// Resolves once the request halts, failing if any error output arrived
/// first.
pub async fn wait_for_completion<S>(events: &mut S) -> Result<RunTranscript, CompletionError>
where
    S: ProcessEventStream + ?Sized,
{
    let transcript = collect(events).await;
    if !transcript.halted() {
        return Err(CompletionError::Disconnected { transcript });
    }
    if transcript.reported_errors() {
        return Err(CompletionError::Failed { transcript });
    }
    Ok(transcript)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use coderun_protocol::{ProcessEvent, ProcessEventStream};

    use super::{collect, wait_for_completion, CompletionError, RunTranscript};

    struct ScriptedStream {
        events: VecDeque<ProcessEvent>,
    }

    impl ScriptedStream {
        fn new(events: Vec<ProcessEvent>) -> Self {
            Self {
                events: events.into(),
            }
        }
    }

    #[async_trait]
    impl ProcessEventStream for ScriptedStream {
        async fn next_event(&mut self) -> Option<ProcessEvent> {
            self.events.pop_front()
        }
    }

    #[tokio::test]
    async fn collect_stops_at_halt() {
        let mut stream = ScriptedStream::new(vec![
            ProcessEvent::Output("a".to_owned()),
            ProcessEvent::Error("warn\n".to_owned()),
            ProcessEvent::Output("b".to_owned()),
            ProcessEvent::Halt("process exited with code 0".to_owned()),
            ProcessEvent::Output("after".to_owned()),
        ]);

        let transcript = collect(&mut stream).await;

        assert_eq!(
            transcript,
            RunTranscript {
                stdout: "ab".to_owned(),
                stderr: "warn\n".to_owned(),
                exit: Some("process exited with code 0".to_owned()),
            }
        );
        assert_eq!(stream.events.len(), 1);
    }

    #[tokio::test]
    async fn completion_succeeds_only_without_error_output() {
        let mut clean = ScriptedStream::new(vec![
            ProcessEvent::Output("1\n".to_owned()),
            ProcessEvent::Halt("process exited with code 0".to_owned()),
        ]);
        assert_eq!(
            wait_for_completion(&mut clean).await.expect("clean run").stdout,
            "1\n"
        );

        let mut failing = ScriptedStream::new(vec![
            ProcessEvent::Error("Traceback\n".to_owned()),
            ProcessEvent::Halt("process exited with code 1".to_owned()),
        ]);
        let error = wait_for_completion(&mut failing)
            .await
            .expect_err("error output should fail the run");
        assert!(matches!(error, CompletionError::Failed { .. }));
        assert_eq!(error.to_string(), "run reported error output: Traceback");
    }

    #[tokio::test]
    async fn completion_without_halt_is_a_disconnect() {
        let mut stream = ScriptedStream::new(vec![ProcessEvent::Output("partial".to_owned())]);

        let error = wait_for_completion(&mut stream)
            .await
            .expect_err("missing halt");

        assert!(matches!(error, CompletionError::Disconnected { .. }));
        assert_eq!(error.transcript().stdout, "partial");
    }
}

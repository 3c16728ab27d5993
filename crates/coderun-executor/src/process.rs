use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coderun_protocol::{Language, RunnerError, RunnerResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::factory::{ExecutorControl, ExecutorFactory};
use crate::sink::EventSink;

const DEFAULT_READ_BUFFER_BYTES: usize = 8192;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How the code payload is written to a freshly started interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFraming {
    /// One JSON string literal followed by a newline; the interpreter's
    /// driver decodes it and keeps stdin open for interaction.
    #[default]
    JsonLine,
    /// The code verbatim, newline-terminated.
    RawLine,
    /// The code verbatim, then stdin is closed.
    RawThenClose,
}

impl PayloadFraming {
    fn frame(self, code: &str) -> Vec<StdinCommand> {
        match self {
            Self::JsonLine => {
                let mut encoded = serde_json::Value::String(code.to_owned()).to_string();
                encoded.push('\n');
                vec![StdinCommand::Write(encoded.into_bytes())]
            }
            Self::RawLine => {
                let mut raw = code.to_owned();
                if !raw.ends_with('\n') {
                    raw.push('\n');
                }
                vec![StdinCommand::Write(raw.into_bytes())]
            }
            Self::RawThenClose => vec![
                StdinCommand::Write(code.as_bytes().to_vec()),
                StdinCommand::Close,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExecutorConfig {
    pub language: Language,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub framing: PayloadFraming,
    pub read_buffer_bytes: usize,
}

impl ProcessExecutorConfig {
    pub fn new(language: Language, program: impl Into<PathBuf>) -> Self {
        Self {
            language,
            program: program.into(),
            args: Vec::new(),
            environment: Vec::new(),
            working_dir: None,
            framing: PayloadFraming::default(),
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_framing(mut self, framing: PayloadFraming) -> Self {
        self.framing = framing;
        self
    }
}

/// Runs each request in its own OS process (one interpreter per request).
#[derive(Debug, Clone)]
pub struct ProcessExecutorFactory {
    config: ProcessExecutorConfig,
}

impl ProcessExecutorFactory {
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessExecutorConfig {
        &self.config
    }
}

#[derive(Debug)]
enum StdinCommand {
    Write(Vec<u8>),
    Close,
}

struct ProcessControl {
    framing: PayloadFraming,
    awaiting_payload: AtomicBool,
    input: mpsc::UnboundedSender<StdinCommand>,
    kill: Arc<Notify>,
}

impl ProcessControl {
    fn submit_payload(&self, code: &str) {
        for command in self.framing.frame(code) {
            if self.input.send(command).is_err() {
                tracing::debug!("executor stdin closed before payload was written");
                return;
            }
        }
    }
}

impl ExecutorControl for ProcessControl {
    fn interact(&self, line: &str) {
        if self.awaiting_payload.swap(false, Ordering::SeqCst) {
            self.submit_payload(line);
            return;
        }
        if self
            .input
            .send(StdinCommand::Write(line.as_bytes().to_vec()))
            .is_err()
        {
            tracing::debug!("dropping input for executor whose stdin is closed");
        }
    }

    fn kill(&self) {
        self.kill.notify_one();
    }
}

impl ExecutorFactory for ProcessExecutorFactory {
    fn language(&self) -> Language {
        self.config.language
    }

    fn start(
        &self,
        initial_payload: Option<&str>,
        sink: EventSink,
    ) -> RunnerResult<Arc<dyn ExecutorControl>> {
        let config = &self.config;
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(config.environment.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = config.working_dir.as_ref() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|error| {
            RunnerError::Spawn(format!(
                "failed to launch {} executor '{}': {error}",
                config.language,
                config.program.display()
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            RunnerError::Process(format!("{} executor stdin unavailable", config.language))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RunnerError::Process(format!("{} executor stdout unavailable", config.language))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RunnerError::Process(format!("{} executor stderr unavailable", config.language))
        })?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let kill = Arc::new(Notify::new());
        let buffer_bytes = config.read_buffer_bytes.max(1);

        tokio::spawn(run_stdin_writer(stdin, input_rx));
        let stdout_pump = tokio::spawn(pump_output(stdout, sink.clone(), false, buffer_bytes));
        let stderr_pump = tokio::spawn(pump_output(stderr, sink.clone(), true, buffer_bytes));

        let language = config.language;
        let kill_signal = Arc::clone(&kill);
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_signal.notified() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(error) = child.start_kill() {
                        tracing::debug!(language = %language, error = %error, "executor kill failed");
                    }
                    child.wait().await
                }
            };
            drain_pumps([stdout_pump, stderr_pump]).await;
            sink.halt(exit_message(status));
        });

        let control = ProcessControl {
            framing: config.framing,
            awaiting_payload: AtomicBool::new(initial_payload.is_none()),
            input: input_tx,
            kill,
        };
        if let Some(code) = initial_payload {
            control.submit_payload(code);
        }
        Ok(Arc::new(control))
    }
}

async fn run_stdin_writer(mut stdin: ChildStdin, mut input: mpsc::UnboundedReceiver<StdinCommand>) {
    while let Some(command) = input.recv().await {
        match command {
            StdinCommand::Write(bytes) => {
                let written = async {
                    stdin.write_all(&bytes).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(error) = written {
                    tracing::debug!(error = %error, "executor stdin write failed");
                    break;
                }
            }
            StdinCommand::Close => break,
        }
    }
}

async fn pump_output<R>(mut reader: R, sink: EventSink, is_stderr: bool, buffer_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let emit = |chunk: String| {
        if chunk.is_empty() {
            return;
        }
        if is_stderr {
            sink.error(chunk);
        } else {
            sink.output(chunk);
        }
    };
    let mut buffer = vec![0_u8; buffer_bytes];
    let mut decoder = Utf8ChunkDecoder::default();
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => emit(decoder.decode(&buffer[..read])),
            Err(error) => {
                tracing::debug!(error = %error, "executor output read failed");
                break;
            }
        }
    }
    emit(decoder.finish());
}

/// Turns raw reads into text, holding back a trailing partial character
/// until the bytes that complete it arrive. Invalid sequences decode to
/// U+FFFD.
#[derive(Debug, Default)]
struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut consumed = 0;
        while consumed < self.pending.len() {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                }
                Err(error) => {
                    let valid_end = consumed + error.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_end]));
                    match error.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_end + invalid;
                        }
                        None => {
                            consumed = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        text
    }

    /// Flushes whatever is still held back at end of stream.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

async fn drain_pumps(pumps: [JoinHandle<()>; 2]) {
    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, pump).await.is_err() {
            abort.abort();
        }
    }
}

fn exit_message(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("process exited with code {code}"),
            None => "process terminated by signal".to_owned(),
        },
        Err(error) => format!("failed to wait for process: {error}"),
    }
}

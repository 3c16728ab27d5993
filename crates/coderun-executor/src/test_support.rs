//! In-memory executors for exercising the registry, pool and host without
//! real interpreters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use coderun_protocol::{Language, ProcessEvent, RunnerError, RunnerResult};

use crate::factory::{ExecutorControl, ExecutorFactory};
use crate::sink::EventSink;

pub type ScriptResponder = Arc<dyn Fn(&str) -> Vec<ProcessEvent> + Send + Sync>;

/// Called with the 1-based attempt number at the top of every start.
pub type StartHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Understands `print(<literal>)` and `raise ...`; anything else halts
/// cleanly without output.
pub fn python_like_responder() -> ScriptResponder {
    Arc::new(|code: &str| {
        let code = code.trim();
        if let Some(inner) = code
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let printed = inner.trim_matches(|c| c == '"' || c == '\'');
            return vec![
                ProcessEvent::Output(format!("{printed}\n")),
                ProcessEvent::Halt("process exited with code 0".to_owned()),
            ];
        }
        if code.starts_with("raise") {
            return vec![
                ProcessEvent::Error(format!("Traceback (most recent call last):\n{code}\n")),
                ProcessEvent::Halt("process exited with code 1".to_owned()),
            ];
        }
        vec![ProcessEvent::Halt("process exited with code 0".to_owned())]
    })
}

/// Keeps running after the payload until killed.
pub fn interactive_responder() -> ScriptResponder {
    Arc::new(|_code: &str| Vec::new())
}

pub struct ScriptedExecutorFactory {
    language: Language,
    warmup_output: Option<String>,
    responder: ScriptResponder,
    failures_remaining: AtomicUsize,
    always_fail: AtomicBool,
    start_plan: Mutex<VecDeque<bool>>,
    start_hook: Mutex<Option<StartHook>>,
    starts: AtomicUsize,
    instances: Mutex<Vec<Arc<ScriptedExecutor>>>,
}

impl ScriptedExecutorFactory {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            warmup_output: None,
            responder: python_like_responder(),
            failures_remaining: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            start_plan: Mutex::new(VecDeque::new()),
            start_hook: Mutex::new(None),
            starts: AtomicUsize::new(0),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn interactive(language: Language) -> Self {
        Self::new(language).with_responder(interactive_responder())
    }

    /// Output emitted as soon as an executor starts, before any payload.
    pub fn with_warmup_output(mut self, output: impl Into<String>) -> Self {
        self.warmup_output = Some(output.into());
        self
    }

    pub fn with_responder(mut self, responder: ScriptResponder) -> Self {
        self.responder = responder;
        self
    }

    pub fn fail_next_starts(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_starts(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Queues per-attempt outcomes for the next starts; `true` fails that
    /// attempt. Once the plan runs out the other failure switches apply.
    pub fn plan_starts(&self, failures: impl IntoIterator<Item = bool>) {
        self.start_plan
            .lock()
            .expect("scripted start plan lock poisoned")
            .extend(failures);
    }

    pub fn set_start_hook(&self, hook: StartHook) {
        *self
            .start_hook
            .lock()
            .expect("scripted start hook lock poisoned") = Some(hook);
    }

    /// Successful and failed start attempts.
    pub fn start_attempts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn instance(&self, index: usize) -> Option<Arc<ScriptedExecutor>> {
        self.instances
            .lock()
            .expect("scripted instances lock poisoned")
            .get(index)
            .cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances
            .lock()
            .expect("scripted instances lock poisoned")
            .len()
    }

    fn should_fail(&self) -> bool {
        let planned = self
            .start_plan
            .lock()
            .expect("scripted start plan lock poisoned")
            .pop_front();
        if let Some(fail) = planned {
            return fail;
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

impl ExecutorFactory for ScriptedExecutorFactory {
    fn language(&self) -> Language {
        self.language
    }

    fn start(
        &self,
        initial_payload: Option<&str>,
        sink: EventSink,
    ) -> RunnerResult<Arc<dyn ExecutorControl>> {
        let attempt = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = self
            .start_hook
            .lock()
            .expect("scripted start hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(attempt);
        }
        if self.should_fail() {
            return Err(RunnerError::Spawn(format!(
                "scripted {} executor refused to start",
                self.language
            )));
        }

        let executor = Arc::new(ScriptedExecutor {
            sink,
            responder: Arc::clone(&self.responder),
            payload: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
        });
        if let Some(output) = self.warmup_output.as_ref() {
            executor.sink.output(output.clone());
        }
        if let Some(code) = initial_payload {
            executor.run_payload(code);
        }
        self.instances
            .lock()
            .expect("scripted instances lock poisoned")
            .push(Arc::clone(&executor));
        Ok(executor)
    }
}

pub struct ScriptedExecutor {
    sink: EventSink,
    responder: ScriptResponder,
    payload: Mutex<Option<String>>,
    inputs: Mutex<Vec<String>>,
    killed: AtomicBool,
}

impl ScriptedExecutor {
    pub fn payload(&self) -> Option<String> {
        self.payload
            .lock()
            .expect("scripted payload lock poisoned")
            .clone()
    }

    /// Lines received after the payload.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs
            .lock()
            .expect("scripted inputs lock poisoned")
            .clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Emits an event as if the interpreter produced it.
    pub fn emit(&self, event: ProcessEvent) {
        self.sink.emit(event);
    }

    fn run_payload(&self, code: &str) {
        *self.payload.lock().expect("scripted payload lock poisoned") = Some(code.to_owned());
        for event in (self.responder)(code) {
            self.sink.emit(event);
        }
    }
}

impl ExecutorControl for ScriptedExecutor {
    fn interact(&self, line: &str) {
        let has_payload = self
            .payload
            .lock()
            .expect("scripted payload lock poisoned")
            .is_some();
        if !has_payload {
            self.run_payload(line);
            return;
        }
        self.inputs
            .lock()
            .expect("scripted inputs lock poisoned")
            .push(line.to_owned());
    }

    fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.sink.halt("process terminated by signal");
        }
    }
}

use std::fmt;
use std::sync::Arc;

use coderun_protocol::{Language, RunnerResult};

use crate::sink::EventSink;

/// Input and termination half of a running executor.
pub trait ExecutorControl: Send + Sync {
    /// Fire-and-forget write to the executor's input. An executor started
    /// without a payload treats its first `interact` as the payload.
    fn interact(&self, line: &str);
    /// Best-effort termination; the halt event still arrives through the sink.
    fn kill(&self);
}

/// Every language runtime integration exposes exactly this shape, which is
/// what makes it poolable.
pub trait ExecutorFactory: Send + Sync {
    fn language(&self) -> Language;
    fn start(
        &self,
        initial_payload: Option<&str>,
        sink: EventSink,
    ) -> RunnerResult<Arc<dyn ExecutorControl>>;
}

/// The `(interact, kill, detach)` triple handed back to callers.
#[derive(Clone)]
pub struct ExecutorControls {
    control: Arc<dyn ExecutorControl>,
    sink: EventSink,
}

impl fmt::Debug for ExecutorControls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorControls")
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

impl ExecutorControls {
    pub fn new(control: Arc<dyn ExecutorControl>, sink: EventSink) -> Self {
        Self { control, sink }
    }

    /// Controls for a request that never got an executor.
    pub fn inert(sink: EventSink) -> Self {
        Self::new(Arc::new(InertControl), sink)
    }

    pub fn interact(&self, line: &str) {
        self.control.interact(line);
    }

    pub fn kill(&self) {
        self.control.kill();
    }

    /// Stops event delivery without stopping the executor.
    pub fn detach(&self) {
        self.sink.detach();
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }
}

struct InertControl;

impl ExecutorControl for InertControl {
    fn interact(&self, _line: &str) {}

    fn kill(&self) {}
}

/// Typed registration table: one optional factory per supported language.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    python: Option<Arc<dyn ExecutorFactory>>,
    scheme: Option<Arc<dyn ExecutorFactory>>,
    sql: Option<Arc<dyn ExecutorFactory>>,
    lark: Option<Arc<dyn ExecutorFactory>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under the language it reports, replacing any
    /// earlier registration.
    pub fn with(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.insert(factory);
        self
    }

    pub fn insert(&mut self, factory: Arc<dyn ExecutorFactory>) {
        let language = factory.language();
        *self.slot_mut(language) = Some(factory);
    }

    pub fn get(&self, language: Language) -> Option<&Arc<dyn ExecutorFactory>> {
        match language {
            Language::Python => self.python.as_ref(),
            Language::Scheme => self.scheme.as_ref(),
            Language::Sql => self.sql.as_ref(),
            Language::Lark => self.lark.as_ref(),
        }
    }

    pub fn languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|language| self.get(*language).is_some())
            .collect()
    }

    fn slot_mut(&mut self, language: Language) -> &mut Option<Arc<dyn ExecutorFactory>> {
        match language {
            Language::Python => &mut self.python,
            Language::Scheme => &mut self.scheme,
            Language::Sql => &mut self.sql,
            Language::Lark => &mut self.lark,
        }
    }
}

impl fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorSet")
            .field("languages", &self.languages())
            .finish()
    }
}

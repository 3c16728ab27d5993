use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use coderun_protocol::{RequestKey, RunnerError, RunnerResult};

use crate::factory::ExecutorControls;

/// Retired keys remembered individually before they fold into the floor.
pub const DEFAULT_RETIRED_KEY_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractOutcome {
    Forwarded,
    Buffered,
    Dropped,
}

/// Executor-side map from request key to the running executor, plus the
/// per-key input that arrived before the executor was registered.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: HashMap<RequestKey, ExecutorControls>,
    pending_input: HashMap<RequestKey, VecDeque<String>>,
    retired: RetiredKeys,
}

/// The most recent retired keys, plus a floor covering every key that aged
/// out of the window. Assumes keys are allocated in increasing order: any
/// unregistered key at or below the floor counts as retired.
#[derive(Debug)]
struct RetiredKeys {
    recent: HashSet<RequestKey>,
    order: VecDeque<RequestKey>,
    floor: Option<RequestKey>,
    window: usize,
}

impl Default for RetiredKeys {
    fn default() -> Self {
        Self::with_window(DEFAULT_RETIRED_KEY_WINDOW)
    }
}

impl RetiredKeys {
    fn with_window(window: usize) -> Self {
        Self {
            recent: HashSet::new(),
            order: VecDeque::new(),
            floor: None,
            window: window.max(1),
        }
    }

    fn contains(&self, key: RequestKey) -> bool {
        self.floor.is_some_and(|floor| key <= floor) || self.recent.contains(&key)
    }

    fn insert(&mut self, key: RequestKey) {
        if self.contains(key) || !self.recent.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.window {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.recent.remove(&oldest);
            self.floor = Some(self.floor.map_or(oldest, |floor| floor.max(oldest)));
        }
    }

    fn len(&self) -> usize {
        self.recent.len()
    }
}

impl ProcessRegistry {
    /// A registry that remembers at most `window` retired keys individually.
    pub fn with_retired_window(window: usize) -> Self {
        Self {
            retired: RetiredKeys::with_window(window),
            ..Self::default()
        }
    }

    /// Stores `controls` for `key` and replays any buffered input into it,
    /// returning how many lines were replayed.
    pub fn register(&mut self, key: RequestKey, controls: ExecutorControls) -> RunnerResult<usize> {
        if self.retired.contains(key) {
            return Err(RunnerError::Protocol(format!(
                "request key {key} was already retired"
            )));
        }
        let controls = match self.processes.entry(key) {
            Entry::Occupied(_) => {
                return Err(RunnerError::Protocol(format!(
                    "request key {key} already has a registered process"
                )));
            }
            Entry::Vacant(slot) => slot.insert(controls),
        };

        let pending = self.pending_input.remove(&key).unwrap_or_default();
        let replayed = pending.len();
        for line in pending {
            controls.interact(&line);
        }
        if replayed > 0 {
            tracing::debug!(key = %key, replayed, "replayed buffered input into registered process");
        }
        Ok(replayed)
    }

    pub fn get(&self, key: RequestKey) -> Option<&ExecutorControls> {
        self.processes.get(&key)
    }

    pub fn contains(&self, key: RequestKey) -> bool {
        self.processes.contains_key(&key)
    }

    pub fn is_retired(&self, key: RequestKey) -> bool {
        self.retired.contains(key)
    }

    pub fn interact(&mut self, key: RequestKey, line: String) -> InteractOutcome {
        if let Some(controls) = self.processes.get(&key) {
            controls.interact(&line);
            return InteractOutcome::Forwarded;
        }
        if self.retired.contains(key) {
            tracing::debug!(key = %key, "dropping input for retired request");
            return InteractOutcome::Dropped;
        }
        self.pending_input.entry(key).or_default().push_back(line);
        InteractOutcome::Buffered
    }

    /// Returns `false` (after logging) when nothing is registered for `key`.
    pub fn kill(&self, key: RequestKey) -> bool {
        match self.processes.get(&key) {
            Some(controls) => {
                controls.kill();
                true
            }
            None => {
                tracing::warn!(key = %key, "kill requested for request with no registered process");
                false
            }
        }
    }

    /// Retires `key`. Later input for it is dropped and it cannot be
    /// registered again.
    pub fn remove(&mut self, key: RequestKey) -> Option<ExecutorControls> {
        self.pending_input.remove(&key);
        self.retired.insert(key);
        self.processes.remove(&key)
    }

    /// Removes every live process, for host shutdown.
    pub fn drain(&mut self) -> Vec<(RequestKey, ExecutorControls)> {
        self.pending_input.clear();
        let mut drained = self.processes.drain().collect::<Vec<_>>();
        drained.sort_by_key(|(key, _)| *key);
        for (key, _) in &drained {
            self.retired.insert(*key);
        }
        drained
    }

    pub fn pending_len(&self, key: RequestKey) -> usize {
        self.pending_input.get(&key).map_or(0, VecDeque::len)
    }

    pub fn keys(&self) -> Vec<RequestKey> {
        self.processes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use coderun_protocol::{Language, RequestKey, RunnerError};

    use super::{InteractOutcome, ProcessRegistry};
    use crate::factory::ExecutorFactory;
    use crate::sink::EventSink;
    use crate::test_support::ScriptedExecutorFactory;

    fn started(factory: &ScriptedExecutorFactory) -> crate::factory::ExecutorControls {
        let sink = EventSink::buffering();
        let control = factory
            .start(Some("print(1)"), sink.clone())
            .expect("start scripted executor");
        crate::factory::ExecutorControls::new(control, sink)
    }

    #[test]
    fn input_sent_before_registration_is_replayed_once_in_order() {
        let factory = ScriptedExecutorFactory::new(Language::Python);
        let mut registry = ProcessRegistry::default();
        let key = RequestKey::new(11);

        assert_eq!(
            registry.interact(key, "x=1\n".to_owned()),
            InteractOutcome::Buffered
        );
        assert_eq!(
            registry.interact(key, "x=1\n".to_owned()),
            InteractOutcome::Buffered
        );
        assert_eq!(registry.pending_len(key), 2);

        let replayed = registry
            .register(key, started(&factory))
            .expect("register process");

        assert_eq!(replayed, 2);
        assert_eq!(registry.pending_len(key), 0);
        assert_eq!(
            factory.instance(0).expect("instance").inputs(),
            vec!["x=1\n".to_owned(), "x=1\n".to_owned()]
        );
    }

    #[test]
    fn input_after_registration_is_forwarded_immediately() {
        let factory = ScriptedExecutorFactory::new(Language::Python);
        let mut registry = ProcessRegistry::default();
        let key = RequestKey::new(1);
        registry.register(key, started(&factory)).expect("register");

        assert_eq!(
            registry.interact(key, "y\n".to_owned()),
            InteractOutcome::Forwarded
        );
        assert_eq!(
            factory.instance(0).expect("instance").inputs(),
            vec!["y\n".to_owned()]
        );
    }

    #[test]
    fn kill_for_unknown_key_is_a_logged_no_op() {
        let registry = ProcessRegistry::default();
        assert!(!registry.kill(RequestKey::new(404)));
    }

    #[test]
    fn kill_reaches_registered_process() {
        let factory = ScriptedExecutorFactory::new(Language::Scheme);
        let mut registry = ProcessRegistry::default();
        let key = RequestKey::new(2);
        registry.register(key, started(&factory)).expect("register");

        assert!(registry.kill(key));
        assert!(factory.instance(0).expect("instance").was_killed());
    }

    #[test]
    fn keys_cannot_be_registered_twice_or_after_retirement() {
        let factory = ScriptedExecutorFactory::new(Language::Sql);
        let mut registry = ProcessRegistry::default();
        let key = RequestKey::new(3);
        registry.register(key, started(&factory)).expect("register");

        assert!(matches!(
            registry.register(key, started(&factory)),
            Err(RunnerError::Protocol(_))
        ));

        assert!(registry.remove(key).is_some());
        assert!(registry.is_retired(key));
        assert!(matches!(
            registry.register(key, started(&factory)),
            Err(RunnerError::Protocol(_))
        ));
        assert_eq!(
            registry.interact(key, "late\n".to_owned()),
            InteractOutcome::Dropped
        );
        assert_eq!(registry.pending_len(key), 0);
    }

    #[test]
    fn drain_retires_every_live_process() {
        let factory = ScriptedExecutorFactory::new(Language::Lark);
        let mut registry = ProcessRegistry::default();
        registry
            .register(RequestKey::new(1), started(&factory))
            .expect("register first");
        registry
            .register(RequestKey::new(2), started(&factory))
            .expect("register second");

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.is_retired(RequestKey::new(1)));
    }

    #[test]
    fn retired_keys_fold_into_a_floor_past_the_window() {
        let factory = ScriptedExecutorFactory::new(Language::Python);
        let mut registry = ProcessRegistry::with_retired_window(3);
        for raw in 1..=10 {
            let key = RequestKey::new(raw);
            registry.register(key, started(&factory)).expect("register");
            assert!(registry.remove(key).is_some());
        }

        assert_eq!(registry.retired.len(), 3);
        assert_eq!(registry.retired.floor, Some(RequestKey::new(7)));
        assert!(registry.is_retired(RequestKey::new(1)));
        assert!(registry.is_retired(RequestKey::new(9)));
        assert_eq!(
            registry.interact(RequestKey::new(2), "late\n".to_owned()),
            InteractOutcome::Dropped
        );
        assert!(matches!(
            registry.register(RequestKey::new(4), started(&factory)),
            Err(RunnerError::Protocol(_))
        ));

        let fresh = RequestKey::new(11);
        assert!(!registry.is_retired(fresh));
        registry.register(fresh, started(&factory)).expect("register fresh key");
        assert!(registry.remove(fresh).is_some());
        assert_eq!(registry.retired.len(), 3);
        assert_eq!(registry.retired.floor, Some(RequestKey::new(8)));
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use coderun_protocol::ProcessEvent;
use tokio::sync::mpsc;

#[derive(Debug)]
enum SinkState {
    Buffering(VecDeque<ProcessEvent>),
    Live(mpsc::UnboundedSender<ProcessEvent>),
    Detached,
}

/// Where an executor writes its output, error and halt events.
///
/// A warm pool slot starts `Buffering`; claiming it replays the backlog into
/// the consumer and switches to `Live` under the same lock, so no live event
/// can overtake a buffered one.
#[derive(Debug, Clone)]
pub struct EventSink {
    state: Arc<Mutex<SinkState>>,
}

impl EventSink {
    pub fn buffering() -> Self {
        Self::with_state(SinkState::Buffering(VecDeque::new()))
    }

    pub fn live(consumer: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self::with_state(SinkState::Live(consumer))
    }

    fn with_state(state: SinkState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn emit(&self, event: ProcessEvent) {
        let mut state = self.lock();
        match &mut *state {
            SinkState::Buffering(backlog) => backlog.push_back(event),
            SinkState::Live(consumer) => {
                if consumer.send(event).is_err() {
                    *state = SinkState::Detached;
                }
            }
            SinkState::Detached => {}
        }
    }

    pub fn output(&self, data: impl Into<String>) {
        self.emit(ProcessEvent::Output(data.into()));
    }

    pub fn error(&self, data: impl Into<String>) {
        self.emit(ProcessEvent::Error(data.into()));
    }

    pub fn halt(&self, message: impl Into<String>) {
        self.emit(ProcessEvent::Halt(message.into()));
    }

    /// Hands the sink to `consumer`, returning how many buffered events were
    /// replayed.
    pub fn claim(&self, consumer: mpsc::UnboundedSender<ProcessEvent>) -> usize {
        let mut state = self.lock();
        let backlog = match std::mem::replace(&mut *state, SinkState::Detached) {
            SinkState::Buffering(backlog) => backlog,
            SinkState::Live(_) | SinkState::Detached => VecDeque::new(),
        };
        let replayed = backlog.len();
        for event in backlog {
            if consumer.send(event).is_err() {
                return replayed;
            }
        }
        *state = SinkState::Live(consumer);
        replayed
    }

    /// Silences the sink. Idempotent.
    pub fn detach(&self) {
        *self.lock() = SinkState::Detached;
    }

    pub fn is_detached(&self) -> bool {
        matches!(*self.lock(), SinkState::Detached)
    }

    /// True when a parked executor already reported its halt.
    pub fn has_buffered_halt(&self) -> bool {
        match &*self.lock() {
            SinkState::Buffering(backlog) => backlog.iter().any(ProcessEvent::is_halt),
            SinkState::Live(_) | SinkState::Detached => false,
        }
    }

    pub fn buffered_len(&self) -> usize {
        match &*self.lock() {
            SinkState::Buffering(backlog) => backlog.len(),
            SinkState::Live(_) | SinkState::Detached => 0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().expect("executor event sink lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use coderun_protocol::ProcessEvent;
    use tokio::sync::mpsc;

    use super::EventSink;

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn claim_replays_backlog_before_live_events() {
        let sink = EventSink::buffering();
        sink.output(">>> ");
        sink.error("warning: slow import\n");
        assert_eq!(sink.buffered_len(), 2);

        let (consumer, mut events) = mpsc::unbounded_channel();
        assert_eq!(sink.claim(consumer), 2);
        sink.output("1\n");
        sink.halt("process exited with code 0");

        assert_eq!(
            drain(&mut events),
            vec![
                ProcessEvent::Output(">>> ".to_owned()),
                ProcessEvent::Error("warning: slow import\n".to_owned()),
                ProcessEvent::Output("1\n".to_owned()),
                ProcessEvent::Halt("process exited with code 0".to_owned()),
            ]
        );
        assert_eq!(sink.buffered_len(), 0);
    }

    #[test]
    fn detach_silences_subsequent_events() {
        let (consumer, mut events) = mpsc::unbounded_channel();
        let sink = EventSink::live(consumer);
        sink.output("before\n");
        sink.detach();
        sink.detach();
        sink.output("after\n");
        sink.halt("done");

        assert_eq!(
            drain(&mut events),
            vec![ProcessEvent::Output("before\n".to_owned())]
        );
        assert!(sink.is_detached());
    }

    #[test]
    fn dropped_consumer_degrades_sink_to_detached() {
        let (consumer, events) = mpsc::unbounded_channel();
        let sink = EventSink::live(consumer);
        drop(events);

        sink.output("nobody listening\n");
        assert!(sink.is_detached());
    }

    #[test]
    fn buffered_halt_is_visible_before_claim() {
        let sink = EventSink::buffering();
        assert!(!sink.has_buffered_halt());
        sink.halt("process exited with code 1");
        assert!(sink.has_buffered_halt());
    }
}

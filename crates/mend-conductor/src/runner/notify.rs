use crate::event::{EventKind, ProgressEvent};
use tokio::sync::mpsc::UnboundedSender;

/// Destination for workflow progress events.
///
/// `emit` must not block: it is called from inside the output pump of a
/// running process.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Forwards events into a channel read by the HTTP stream.
/// A closed channel (client gone) is not an error; events are dropped.
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event dropped: client channel closed");
        }
    }
}

/// Prints events to stdout (headless runs).
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: ProgressEvent) {
        match event.kind {
            EventKind::Output => println!("  │ {}", event.message),
            EventKind::Info => println!("{}", event.message),
            EventKind::Success => println!("✓ {}", event.message),
            EventKind::Error => println!("✗ {}", event.message),
            EventKind::Url => println!("→ {}", event.message),
            EventKind::Status => println!("\n[status] {}", event.message),
            EventKind::Complete => println!("[complete] {}", event.message),
        }
    }
}

/// Collects events in memory (for testing).
#[derive(Default)]
pub struct CollectSink {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        crate::state::machine::lock(&self.events).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.message)
            .collect()
    }
}

impl EventSink for CollectSink {
    fn emit(&self, event: ProgressEvent) {
        crate::state::machine::lock(&self.events).push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_sink_keeps_order() {
        let sink = CollectSink::new();
        sink.emit(ProgressEvent::info("a"));
        sink.emit(ProgressEvent::error("b"));
        sink.emit(ProgressEvent::info("c"));
        assert_eq!(sink.messages(), vec!["a", "b", "c"]);
        assert_eq!(sink.of_kind(EventKind::Info), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.emit(ProgressEvent::output("line"));
        assert_eq!(rx.recv().await, Some(ProgressEvent::output("line")));
    }

    #[test]
    fn channel_sink_tolerates_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        sink.emit(ProgressEvent::info("nobody listening"));
    }
}

//! Event stream multiplexer.
//!
//! Many producers (the coordinator, instrument agents, section children)
//! write to one shared queue; a single consumer drains it and stamps the
//! monotonically increasing `seq` at serialisation time. Assigning `seq`
//! at the drain point is what guarantees monotonicity across concurrent
//! producers.

use tokio::sync::mpsc;
use tracing::debug;

use bandproto::events::{SequencedEvent, StreamEvent};

/// Create a connected producer/consumer pair for one request.
pub fn channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventStream { rx, next_seq: 0 })
}

/// Cloneable producer handle shared across agent tasks.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSender {
    /// Enqueue one event. A closed consumer (client went away) is not an
    /// error for producers; the event is dropped.
    pub fn send(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            debug!("event dropped, stream consumer closed");
        }
    }

    pub fn send_all(&self, events: impl IntoIterator<Item = StreamEvent>) {
        for event in events {
            self.send(event);
        }
    }
}

/// Single-consumer drain side; owns the sequence counter.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    next_seq: u64,
}

impl EventStream {
    /// Next event with its `seq` stamped; `None` once all senders are
    /// dropped and the queue is drained.
    pub async fn next(&mut self) -> Option<SequencedEvent> {
        let event = self.rx.recv().await?;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(SequencedEvent { seq, event })
    }

    /// Drain everything already queued without waiting.
    pub fn drain_ready(&mut self) -> Vec<SequencedEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            let seq = self.next_seq;
            self.next_seq += 1;
            out.push(SequencedEvent { seq, event });
        }
        out
    }

    /// Collect every remaining event until the channel closes.
    pub async fn collect_all(mut self) -> Vec<SequencedEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.next().await {
            out.push(event);
        }
        out
    }
}

/// Serialize one sequenced event as an NDJSON line.
pub fn ndjson_line(event: &SequencedEvent) -> String {
    let mut line = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(message: &str) -> StreamEvent {
        StreamEvent::Status {
            message: message.to_string(),
            agent_id: None,
            section_name: None,
        }
    }

    #[tokio::test]
    async fn test_seq_starts_at_zero_and_increases() {
        let (tx, mut rx) = channel();
        tx.send(status("a"));
        tx.send(status("b"));
        assert_eq!(rx.next().await.unwrap().seq, 0);
        assert_eq!(rx.next().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_seq_monotonic_across_cloned_producers() {
        let (tx, rx) = channel();
        let mut handles = Vec::new();
        for i in 0..8 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..10 {
                    tx.send(status(&format!("{i}-{j}")));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(tx);

        let events = rx.collect_all().await;
        assert_eq!(events.len(), 80);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
        }
    }

    #[tokio::test]
    async fn test_send_after_consumer_drop_is_silent() {
        let (tx, rx) = channel();
        drop(rx);
        tx.send(status("dropped"));
    }

    #[test]
    fn test_ndjson_line_ends_with_newline() {
        let line = ndjson_line(&SequencedEvent {
            seq: 3,
            event: status("hello"),
        });
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"seq\":3"));
    }
}

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::{JobStatus, TranscriptionRecord};

/// Registry of push subscribers.
///
/// Each subscriber owns an unbounded channel; a subscriber whose receiver
/// has gone away is evicted on the next broadcast rather than stalling the
/// others.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber and return its id plus the message stream.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, tx);
        debug!(subscriber = id, "push subscriber attached");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .remove(&id);
        debug!(subscriber = id, "push subscriber detached");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .len()
    }

    /// Deliver a message to every subscriber, dropping the ones that no
    /// longer accept messages.
    pub fn broadcast(&self, message: Value) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|id, tx| {
            let delivered = tx.send(message.clone()).is_ok();
            if !delivered {
                debug!(subscriber = id, "evicting dead push subscriber");
            }
            delivered
        });
    }

    /// Broadcast one state transition.
    pub fn publish_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: i64,
        error: Option<&str>,
    ) {
        let mut message = json!({
            "type": "status",
            "id": id,
            "status": status.as_str(),
            "progress": progress,
        });
        if let Some(error) = error {
            message["error"] = json!(error);
        }
        self.broadcast(message);
    }

    /// Broadcast terminal success with the full record attached.
    pub fn publish_completed(&self, record: &TranscriptionRecord) {
        self.broadcast(json!({
            "type": "completed",
            "id": record.id,
            "transcription": record,
        }));
    }

    /// Broadcast terminal failure.
    pub fn publish_error(&self, id: &str, error: &str) {
        self.broadcast(json!({
            "type": "error",
            "id": id,
            "error": error,
        }));
    }

    /// Current status snapshot for a `subscribe` request.
    pub fn status_snapshot(record: &TranscriptionRecord) -> Value {
        let mut message = json!({
            "type": "status",
            "id": record.id,
            "status": record.status.as_str(),
            "progress": record.progress,
        });
        if let Some(error) = &record.error_message {
            message["error"] = json!(error);
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_live_subscribers() {
        let hub = EventHub::new();
        let (_id_a, mut rx_a) = hub.subscribe();
        let (_id_b, mut rx_b) = hub.subscribe();

        hub.publish_status("youtube_abc12345678", JobStatus::Downloading, 10, None);

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a["type"], "status");
        assert_eq!(got_a["progress"], 10);
        assert_eq!(got_a, got_b);
    }

    #[tokio::test]
    async fn dead_subscribers_are_evicted_on_broadcast() {
        let hub = EventHub::new();
        let (_id_a, rx_a) = hub.subscribe();
        let (_id_b, mut rx_b) = hub.subscribe();
        drop(rx_a);

        hub.publish_error("youtube_abc12345678", "download failed");
        assert_eq!(hub.subscriber_count(), 1);

        let got = rx_b.recv().await.unwrap();
        assert_eq!(got["type"], "error");
        assert_eq!(got["error"], "download failed");
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry() {
        let hub = EventHub::new();
        let (id, _rx) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn status_message_omits_absent_error() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.subscribe();
        hub.publish_status("id", JobStatus::Pending, 0, None);
        let message = rx.try_recv().unwrap();
        assert!(message.get("error").is_none());
    }
}

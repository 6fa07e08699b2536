//! Status events emitted by the sync workers.
//!
//! Observers (the daemon's event log, a UI badge) subscribe to one [`Bus`];
//! topics live in `fieldsync-topics`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// One status event. `time` is RFC3339 UTC with millisecond precision.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Self {
        let payload = serde_json::to_value(payload)
            .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
        Self {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload,
        }
    }
}

/// Fan-out of sync status events.
///
/// Slow subscribers lag rather than stall a sweep. Events published with no
/// subscriber are dropped.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers the event reached.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) -> usize {
        self.tx.send(Envelope::new(kind, payload)).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish("sync.asset.uploaded", &json!({"id": "a1"})), 1);
        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, "sync.asset.uploaded");
        assert_eq!(env.payload["id"], "a1");
        assert!(env.time.ends_with('Z'));
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let bus = Bus::default();
        assert_eq!(bus.receiver_count(), 0);
        assert_eq!(bus.publish("progress.updated", &json!({"area": 50})), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_oldest_events() {
        let bus = Bus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.publish("sync.mutations.drained", &json!({"applied": i}));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().payload["applied"], 1);
    }
}

//! C8 — Event Bus.
//!
//! A process-wide publisher of job lifecycle events (spec §4.8, §6.3).
//! Subscribers are `tokio::sync::broadcast::Receiver`s, each with its own
//! bounded queue; a slow subscriber lags and drops old events rather than
//! ever making a publisher wait, which is the "publication is non-blocking"
//! guarantee spec §4.8 asks for — `Sender::send` never parks the calling
//! thread, so worker threads publishing off the std-thread job pool are
//! never stalled by a stuck SSE client.

use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Default per-subscriber backlog before old events start getting dropped
/// (surfaced to a lagging receiver as `RecvError::Lagged`).
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Value>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A fresh subscription stream; used by the SSE handler (spec §6.2
    /// `subscribe_events`). Events published before this call are not
    /// replayed — reconnecting clients recover missed state by polling the
    /// registry, per spec §4.8 "no guaranteed delivery across disconnects".
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    fn publish(&self, event: Value) {
        // No receivers is not an error worth logging; SSE clients come and go.
        let _ = self.tx.send(event);
    }

    pub fn created(&self, id: &str, task_type: &str, path: &str) {
        self.publish(json!({"event": "created", "id": id, "type": task_type, "path": path}));
    }

    pub fn queued(&self, id: &str, task_type: &str, path: &str) {
        self.publish(json!({"event": "queued", "id": id, "type": task_type, "path": path}));
    }

    pub fn started(&self, id: &str, task_type: &str, path: &str) {
        self.publish(json!({"event": "started", "id": id, "type": task_type, "path": path}));
    }

    pub fn progress(&self, id: &str, total: u64, processed: u64, progress: Option<u64>) {
        self.publish(json!({
            "event": "progress",
            "id": id,
            "total": total,
            "processed": processed,
            "progress": progress,
        }));
    }

    pub fn current(&self, id: &str, current: &str) {
        self.publish(json!({"event": "current", "id": id, "current": current}));
    }

    pub fn finished(&self, id: &str, error: Option<&str>) {
        self.publish(json!({"event": "finished", "id": id, "error": error}));
    }

    pub fn cancel(&self, id: &str) {
        self.publish(json!({"event": "cancel", "id": id}));
    }

    pub fn cancel_all(&self, count: usize) {
        self.publish(json!({"event": "cancel_all", "count": count}));
    }

    pub fn purge(&self, count: usize) {
        self.publish(json!({"event": "purge", "count": count}));
    }

    pub fn pause(&self, paused: bool) {
        self.publish(json!({"event": "pause", "paused": paused}));
    }

    pub fn concurrency(&self, value: u64) {
        self.publish(json!({"event": "concurrency", "value": value}));
    }

    pub fn result(&self, id: &str, result: &Value) {
        self.publish(json!({"event": "result", "id": id, "result": result}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.created("job1", "thumbnail", "a.mp4");
        bus.queued("job1", "thumbnail", "a.mp4");
        bus.started("job1", "thumbnail", "a.mp4");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first["event"], "created");
        assert_eq!(second["event"], "queued");
        assert_eq!(third["event"], "started");
    }

    #[tokio::test]
    async fn publish_never_blocks_with_no_subscribers() {
        let bus = EventBus::new(4);
        bus.finished("job1", None);
        bus.finished("job2", Some("boom"));
    }
}

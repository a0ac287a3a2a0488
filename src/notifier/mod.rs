//! Bounded event bus for deploy, health and stats events.
//!
//! Producers never block: the channel drops on overflow because every event
//! here is advisory; the database copy of deployment state and logs is the
//! source of truth. The HTTP layer re-broadcasts the bus over SSE.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::utils::now_rfc3339;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Running,
    Success,
    Failed,
    Log,
    Health,
    Stats,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: String,
}

impl Event {
    pub fn new(kind: EventKind, app_id: impl Into<String>) -> Self {
        Self {
            kind,
            app_id: app_id.into(),
            deployment_id: None,
            message: None,
            payload: None,
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

pub struct Notifier {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    broadcast: Mutex<Option<broadcast::Sender<Event>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity);
        let (broadcast_tx, _) = broadcast::channel(capacity);

        let fanout = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // No receivers is fine; SSE clients come and go.
                let _ = fanout.send(event);
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            broadcast: Mutex::new(Some(broadcast_tx)),
        }
    }

    /// Non-blocking emit. Overflow and post-close emits drop the event.
    pub fn emit(&self, event: Event) {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    debug!("Notifier channel full, dropping event");
                }
            }
            None => debug!("Notifier closed, dropping event"),
        }
    }

    pub fn deploy_event(&self, kind: EventKind, app_id: &str, deployment_id: &str, message: &str) {
        self.emit(
            Event::new(kind, app_id)
                .with_deployment(deployment_id)
                .with_message(message),
        );
    }

    pub fn log_line(&self, app_id: &str, deployment_id: &str, line: &str) {
        self.deploy_event(EventKind::Log, app_id, deployment_id, line);
    }

    /// Read-only view for consumers; each subscriber gets its own cursor.
    /// After close, the returned stream is already at end.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        match self.broadcast.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Close the producer side. Idempotent; the forwarding task drains what
    /// is buffered and ends, which in turn ends subscriber streams.
    pub fn close(&self) {
        self.tx.lock().take();
        self.broadcast.lock().take();
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.deploy_event(EventKind::Running, "a1", "d1", "deploy started");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Running);
        assert_eq!(event.app_id, "a1");
        assert_eq!(event.deployment_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn test_overflow_drops_not_blocks() {
        let notifier = Notifier::with_capacity(2);
        // No subscriber and a tiny buffer: emits beyond capacity must return
        // immediately without panicking.
        for i in 0..50 {
            notifier.log_line("a1", "d1", &format!("line {i}"));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_stream() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.deploy_event(EventKind::Success, "a1", "d1", "done");
        notifier.close();
        notifier.close();
        notifier.deploy_event(EventKind::Failed, "a1", "d2", "late");

        // The pre-close event arrives, then the stream ends.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Success);
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = Event::new(EventKind::Health, "a1")
            .with_payload(serde_json::json!({"status": "running", "health": "healthy"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "HEALTH");
        assert_eq!(json["app_id"], "a1");
        assert!(json.get("deployment_id").is_none());
    }
}

//! Per-deployment log fan-out inside the agent.
//!
//! `ExecuteDeploy` publishes its lines under the deployment id while any
//! number of `StreamDeployLogs` subscriptions read them through their own
//! bounded channel. Lines are advisory; a slow subscriber loses lines
//! rather than stalling the deploy, and the server's database copy remains
//! authoritative.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of each subscription channel.
const SUBSCRIPTION_CAPACITY: usize = 512;

#[derive(Default)]
pub struct LogBus {
    subscribers: DashMap<String, Vec<mpsc::Sender<String>>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription for a deployment's log lines. The stream
    /// ends when the publisher closes the deployment.
    pub fn subscribe(&self, deployment_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscribers
            .entry(deployment_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Push a line to every live subscription; full channels drop.
    pub fn publish(&self, deployment_id: &str, line: &str) {
        if let Some(mut entry) = self.subscribers.get_mut(deployment_id) {
            entry.retain(|tx| match tx.try_send(line.to_string()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(deployment_id = %deployment_id, "Log subscription full, dropping line");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Deploy finished: drop all senders so subscribers see end-of-stream.
    pub fn close(&self, deployment_id: &str) {
        self.subscribers.remove(deployment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = LogBus::new();
        let mut a = bus.subscribe("d1");
        let mut b = bus.subscribe("d1");

        bus.publish("d1", "line one");

        assert_eq!(a.recv().await.unwrap(), "line one");
        assert_eq!(b.recv().await.unwrap(), "line one");
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = LogBus::new();
        let mut rx = bus.subscribe("d1");
        bus.publish("d1", "last");
        bus.close("d1");

        assert_eq!(rx.recv().await.unwrap(), "last");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_without_blocking() {
        let bus = LogBus::new();
        let mut rx = bus.subscribe("d1");

        for i in 0..(SUBSCRIPTION_CAPACITY + 100) {
            bus.publish("d1", &format!("line {i}"));
        }

        // The first CAPACITY lines made it; the rest were dropped.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIPTION_CAPACITY);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = LogBus::new();
        bus.publish("nobody", "into the void");
    }
}

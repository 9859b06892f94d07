//! Status broadcast hub.
//!
//! Dashboards register an observer and get a bounded outbox; their socket task
//! drains it. Publishing serializes an event once and offers it to every
//! outbox without waiting. Delivery is best effort: once an outbox holds
//! `observer_buffer` undelivered events, further events are dropped for that
//! dashboard alone until it catches up.
//! Observers leave the set only through their own disconnect path.

use crate::common::time;
use crate::service::protocol::StatusEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

pub type ObserverId = u64;

/// A registered dashboard's end of the hub.
pub struct Observer {
    pub id: ObserverId,
    pub outbox: mpsc::Receiver<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Outbox full; the event was dropped for that observer.
    pub dropped: usize,
    /// Observer already gone but not yet unregistered.
    pub closed: usize,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped + self.closed
    }
}

pub struct StatusHub {
    observers: RwLock<HashMap<ObserverId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl StatusHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Add an observer and queue the `connected` greeting for it alone.
    pub async fn register(&self) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, outbox) = mpsc::channel(self.buffer);

        match serde_json::to_string(&StatusEvent::connected(&time::now())) {
            Ok(greeting) => {
                // Fresh channel with capacity >= 1, cannot be full
                let _ = tx.try_send(greeting);
            }
            Err(e) => tracing::error!("Failed to serialize greeting: {}", e),
        }

        let count = {
            let mut observers = self.observers.write().await;
            observers.insert(id, tx);
            observers.len()
        };
        tracing::debug!("Observer {} registered ({} total)", id, count);

        Observer { id, outbox }
    }

    /// Remove an observer. Returns false if it was not registered.
    pub async fn unregister(&self, id: ObserverId) -> bool {
        let removed = self.observers.write().await.remove(&id).is_some();
        if removed {
            tracing::debug!("Observer {} unregistered", id);
        }
        removed
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Offer `event` to every registered observer.
    ///
    /// Works on a snapshot of the set, so observers joining or leaving during
    /// the fan-out neither block it nor receive a duplicate.
    pub async fn publish(&self, event: &StatusEvent) -> PublishReport {
        let targets: Vec<(ObserverId, mpsc::Sender<String>)> = {
            let observers = self.observers.read().await;
            if observers.is_empty() {
                return PublishReport::default();
            }
            observers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize status event: {}", e);
                return PublishReport::default();
            }
        };

        tracing::info!(
            "[BROADCAST] Sending status update to {} client(s): {}",
            targets.len(),
            json
        );

        let mut report = PublishReport::default();
        for (id, tx) in targets {
            match tx.try_send(json.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Observer {} is not keeping up, event dropped", id);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Observer {} already closed", id);
                    report.closed += 1;
                }
            }
        }
        report
    }
}

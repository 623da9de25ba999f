//! In-process notification channel for "job X may be claimable".
//!
//! Delivery is at-least-once at best: notifications can be duplicated (the
//! claim CAS rejects the extra ones) or lost (workers also poll the store).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use wallettaser_core::JobId;

#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<JobId>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn push(&self, job_id: JobId) {
        // The receiver lives as long as any clone of the queue.
        let _ = self.tx.send(job_id);
    }

    /// Notify after `delay` (used for backoff).
    pub fn push_after(&self, job_id: JobId, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(job_id);
        });
    }

    /// Wait up to `wait` for the next notification.
    pub async fn next(&self, wait: Duration) -> Option<JobId> {
        tokio::time::timeout(wait, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }
}

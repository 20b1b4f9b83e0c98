//! Background quota accounting.
//!
//! Usage updates are fire-and-forget from the request path: they land on a
//! bounded queue and a single worker applies them. The queue is drained on
//! shutdown so completed interactions are never lost to an exit race.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use archestra_core::{QuotaEnforcer, Repository, UsageDelta};

#[derive(Clone)]
pub struct QuotaWorker {
    tx: mpsc::Sender<UsageDelta>,
    dropped_total: Arc<AtomicU64>,
}

pub struct QuotaWorkerHandle {
    handle: JoinHandle<()>,
}

impl QuotaWorker {
    /// Spawn the worker task. Dropping every `QuotaWorker` clone closes the
    /// queue; the returned handle then resolves once the backlog is drained.
    pub fn spawn(repo: Repository, queue_size: usize) -> (Self, QuotaWorkerHandle) {
        let (tx, mut rx) = mpsc::channel::<UsageDelta>(queue_size);
        let dropped_total = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(async move {
            let enforcer = QuotaEnforcer::new(repo);
            while let Some(delta) = rx.recv().await {
                enforcer.record_usage(&delta);
            }
            tracing::debug!("quota worker drained");
        });

        (
            Self { tx, dropped_total },
            QuotaWorkerHandle { handle },
        )
    }

    /// Enqueue a usage delta without blocking the response path. A full
    /// queue drops the update and counts it.
    pub fn try_enqueue(&self, delta: UsageDelta) {
        if let Err(err) = self.tx.try_send(delta) {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, "quota queue full; dropping usage update");
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

impl QuotaWorkerHandle {
    /// Wait for the worker to drain and exit. Callers must drop their
    /// `QuotaWorker` clones first or this never resolves.
    pub async fn drained(self) {
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "quota worker task failed");
        }
    }
}

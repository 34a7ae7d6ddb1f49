//! Crash recovery: finds pools whose heartbeat went stale and rehomes their
//! in-progress jobs.
//!
//! Reaping is self-coordinating through idempotence rather than election:
//! concurrent reapers may work the same dead pool, and the emptiness of its
//! in-progress lists is the shared terminating condition.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{DEAD_POOL_CUTOFF_SECS, REAP_JITTER_SECS, REAP_PERIOD_SECS};
use crate::job::now_epoch_seconds;
use crate::store::JobStore;

pub(crate) struct DeadPoolReaper {
    namespace: String,
    pool_id: String,
    /// Fallback when a dead pool's heartbeat hash is already gone and its
    /// advertised job names are unrecoverable.
    registered_names: Vec<String>,
    store: JobStore,
}

pub(crate) struct ReaperHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.handle.await;
    }
}

impl DeadPoolReaper {
    pub fn new(
        namespace: String,
        pool_id: String,
        registered_names: Vec<String>,
        store: JobStore,
    ) -> Self {
        Self {
            namespace,
            pool_id,
            registered_names,
            store,
        }
    }

    pub fn spawn(self) -> ReaperHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let mut reaper = self;
        let handle = tokio::spawn(async move {
            loop {
                let jitter = rand::rng().random_range(0..REAP_JITTER_SECS);
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(REAP_PERIOD_SECS + jitter)) => {
                        if let Err(err) = reaper.reap().await {
                            tracing::error!("dead pool reap failed: {err}");
                        }
                    }
                }
            }
        });
        ReaperHandle { stop_tx, handle }
    }

    /// One full pass over the pool set.
    pub async fn reap(&mut self) -> Result<()> {
        let cutoff = now_epoch_seconds() - DEAD_POOL_CUTOFF_SECS;
        let pool_ids = self.store.pool_ids(&self.namespace).await?;
        for dead_pool_id in pool_ids {
            if dead_pool_id == self.pool_id {
                continue;
            }
            let heartbeat = self
                .store
                .read_heartbeat(&self.namespace, &dead_pool_id)
                .await?;
            let heartbeat_at = heartbeat
                .get("heartbeat_at")
                .and_then(|raw| raw.parse::<i64>().ok());
            let dead = match heartbeat_at {
                None => true,
                Some(at) => at < cutoff,
            };
            if !dead {
                continue;
            }

            let job_names: Vec<String> = match heartbeat.get("job_names") {
                Some(csv) if !csv.is_empty() => csv.split(',').map(str::to_string).collect(),
                _ => self.registered_names.clone(),
            };
            let mut requeued = 0usize;
            for name in &job_names {
                while let Some(_payload) = self
                    .store
                    .requeue_in_progress(&self.namespace, &dead_pool_id, name)
                    .await?
                {
                    requeued += 1;
                }
            }
            self.store
                .remove_heartbeat(&self.namespace, &dead_pool_id)
                .await?;
            tracing::warn!(
                dead_pool_id = %dead_pool_id,
                requeued,
                "reaped dead worker pool"
            );
        }
        Ok(())
    }
}

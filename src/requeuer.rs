//! Promotes due entries from a time-sorted set back into pending lists.
//!
//! One instance runs against `retry`, another against `scheduled`; the loop
//! is identical, only the source key differs. Entries for names this fleet
//! never registered are left alone.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{REQUEUE_JITTER_MS, REQUEUE_PERIOD_MS};
use crate::store::JobStore;

pub(crate) struct Requeuer {
    namespace: String,
    source_key: String,
    known_names: Vec<String>,
    store: JobStore,
    stop_rx: mpsc::Receiver<()>,
}

pub(crate) struct RequeuerHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RequeuerHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.handle.await;
    }
}

impl Requeuer {
    pub fn spawn(
        namespace: String,
        source_key: String,
        known_names: Vec<String>,
        store: JobStore,
    ) -> RequeuerHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let requeuer = Self {
            namespace,
            source_key,
            known_names,
            store,
            stop_rx,
        };
        let handle = tokio::spawn(requeuer.run());
        RequeuerHandle { stop_tx, handle }
    }

    async fn run(mut self) {
        loop {
            self.process().await;
            let jitter = rand::rng().random_range(0..REQUEUE_JITTER_MS);
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                _ = tokio::time::sleep(Duration::from_millis(REQUEUE_PERIOD_MS + jitter)) => {}
            }
        }
    }

    async fn process(&mut self) {
        loop {
            match self
                .store
                .requeue_due(&self.namespace, &self.source_key, &self.known_names)
                .await
            {
                Ok(0) => break,
                Ok(moved) => {
                    tracing::debug!(source = %self.source_key, moved, "requeued due jobs");
                }
                Err(err) => {
                    tracing::error!(source = %self.source_key, "requeue pass failed: {err}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{now_epoch_seconds, Job};
    use crate::keys;
    use crate::test_support::RedisTestContext;

    async fn seed_retry(ctx: &mut RedisTestContext, name: &str, due_delta: i64) -> Job {
        let job = Job::new(name, serde_json::Map::new());
        let payload = job.serialize().unwrap();
        let score = now_epoch_seconds() + due_delta;
        ctx.store
            .add_payload_to_zset(&keys::retry(&ctx.namespace), &payload, score)
            .await
            .unwrap();
        job
    }

    #[tokio::test]
    async fn due_entries_move_to_pending() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        seed_retry(&mut ctx, "email", -5).await;
        let mut requeuer = Requeuer {
            namespace: ctx.namespace.clone(),
            source_key: keys::retry(&ctx.namespace),
            known_names: vec!["email".into()],
            store: ctx.store.clone(),
            stop_rx: mpsc::channel(1).1,
        };
        requeuer.process().await;

        assert_eq!(ctx.store.retry_count(&ctx.namespace).await.unwrap(), 0);
        assert_eq!(
            ctx.store.pending_count(&ctx.namespace, "email").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn future_entries_stay_put() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        seed_retry(&mut ctx, "email", 3600).await;
        let mut requeuer = Requeuer {
            namespace: ctx.namespace.clone(),
            source_key: keys::retry(&ctx.namespace),
            known_names: vec!["email".into()],
            store: ctx.store.clone(),
            stop_rx: mpsc::channel(1).1,
        };
        requeuer.process().await;

        assert_eq!(ctx.store.retry_count(&ctx.namespace).await.unwrap(), 1);
        assert_eq!(
            ctx.store.pending_count(&ctx.namespace, "email").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn unknown_names_are_left_for_other_tenants() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        seed_retry(&mut ctx, "foreign_job", -5).await;
        seed_retry(&mut ctx, "email", -5).await;
        let mut requeuer = Requeuer {
            namespace: ctx.namespace.clone(),
            source_key: keys::retry(&ctx.namespace),
            known_names: vec!["email".into()],
            store: ctx.store.clone(),
            stop_rx: mpsc::channel(1).1,
        };
        requeuer.process().await;

        assert_eq!(ctx.store.retry_count(&ctx.namespace).await.unwrap(), 1);
        assert_eq!(
            ctx.store.pending_count(&ctx.namespace, "email").await.unwrap(),
            1
        );
        assert_eq!(
            ctx.store
                .pending_count(&ctx.namespace, "foreign_job")
                .await
                .unwrap(),
            0
        );
    }
}

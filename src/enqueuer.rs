//! Producer-side API: puts envelopes onto pending lists, the scheduled set,
//! or behind a uniqueness marker.

use anyhow::Result;
use serde_json::Value;

use crate::job::{now_epoch_seconds, Job};
use crate::store::{JobStore, UniqueDestination};

#[derive(Clone)]
pub struct Enqueuer {
    namespace: String,
    store: JobStore,
}

impl Enqueuer {
    pub fn new(namespace: impl Into<String>, store: JobStore) -> Self {
        Self {
            namespace: namespace.into(),
            store,
        }
    }

    pub async fn connect(namespace: impl Into<String>, redis_dsn: &str) -> Result<Self> {
        Ok(Self::new(namespace, JobStore::new(redis_dsn).await?))
    }

    /// Enqueues a job for immediate execution.
    pub async fn enqueue(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        let job = Job::new(name, args);
        self.store.enqueue(&self.namespace, &job).await?;
        tracing::debug!(name = %job.name, id = %job.id, "job enqueued");
        Ok(job)
    }

    /// Enqueues a job to run no earlier than `seconds_from_now`.
    pub async fn enqueue_in(
        &mut self,
        name: &str,
        seconds_from_now: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        self.enqueue_at(name, now_epoch_seconds() + seconds_from_now, args)
            .await
    }

    /// Enqueues a job to run no earlier than the given epoch second.
    pub async fn enqueue_at(
        &mut self,
        name: &str,
        run_at_epoch: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        let mut job = Job::new(name, args);
        job.scheduled_at = run_at_epoch;
        self.store.enqueue_scheduled(&self.namespace, &job).await?;
        tracing::debug!(name = %job.name, id = %job.id, run_at_epoch, "job scheduled");
        Ok(job)
    }

    /// Enqueues a job unless an identical (name, args) job is already
    /// pending or in progress. Returns the job when accepted, None when the
    /// enqueue was a duplicate no-op.
    pub async fn enqueue_unique(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Option<Job>> {
        let mut job = Job::new(name, args);
        job.unique = true;
        let accepted = self
            .store
            .enqueue_unique(&self.namespace, &job, UniqueDestination::Pending)
            .await?;
        Ok(accepted.then_some(job))
    }

    /// The unique variant of [`enqueue_in`](Self::enqueue_in).
    pub async fn enqueue_unique_in(
        &mut self,
        name: &str,
        seconds_from_now: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Option<Job>> {
        let run_at = now_epoch_seconds() + seconds_from_now;
        let mut job = Job::new(name, args);
        job.unique = true;
        job.scheduled_at = run_at;
        let accepted = self
            .store
            .enqueue_unique(&self.namespace, &job, UniqueDestination::Scheduled { score: run_at })
            .await?;
        Ok(accepted.then_some(job))
    }

    /// Pauses or resumes dequeues for a job name, fleet-wide.
    pub async fn set_paused(&mut self, name: &str, paused: bool) -> Result<()> {
        self.store.set_paused(&self.namespace, name, paused).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    fn args(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn enqueue_appends_and_registers_name() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(ctx.namespace.clone(), ctx.store.clone());
        let job = enqueuer
            .enqueue("email", args(json!({ "to": "a@b.c" })))
            .await
            .unwrap();
        assert_eq!(job.name, "email");
        assert_eq!(
            ctx.store.pending_count(&ctx.namespace, "email").await.unwrap(),
            1
        );
        let known = ctx.store.known_job_names(&ctx.namespace).await.unwrap();
        assert_eq!(known, vec!["email".to_string()]);
    }

    #[tokio::test]
    async fn enqueue_in_lands_in_scheduled_with_due_score() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(ctx.namespace.clone(), ctx.store.clone());
        let before = now_epoch_seconds();
        let job = enqueuer
            .enqueue_in("report", 300, serde_json::Map::new())
            .await
            .unwrap();
        assert!(job.scheduled_at >= before + 300);

        let scheduled = ctx
            .store
            .zset_jobs(&keys::scheduled(&ctx.namespace))
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 1);
        let (stored, score) = &scheduled[0];
        assert_eq!(stored.id, job.id);
        assert_eq!(*score, job.scheduled_at);
        assert_eq!(stored.scheduled_at, job.scheduled_at);
    }

    #[tokio::test]
    async fn duplicate_unique_enqueue_is_a_noop() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(ctx.namespace.clone(), ctx.store.clone());

        let first = enqueuer
            .enqueue_unique("index", args(json!({ "id": 7 })))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(first.unwrap().unique);

        let second = enqueuer
            .enqueue_unique("index", args(json!({ "id": 7 })))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(
            ctx.store.pending_count(&ctx.namespace, "index").await.unwrap(),
            1
        );

        // Different args are a different logical job.
        let third = enqueuer
            .enqueue_unique("index", args(json!({ "id": 8 })))
            .await
            .unwrap();
        assert!(third.is_some());
        assert_eq!(
            ctx.store.pending_count(&ctx.namespace, "index").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn unique_scheduled_enqueue_guards_the_marker() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(ctx.namespace.clone(), ctx.store.clone());

        let first = enqueuer
            .enqueue_unique_in("digest", 600, serde_json::Map::new())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = enqueuer
            .enqueue_unique_in("digest", 600, serde_json::Map::new())
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(ctx.store.scheduled_count(&ctx.namespace).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn paused_flag_round_trips() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(ctx.namespace.clone(), ctx.store.clone());
        enqueuer.set_paused("email", true).await.unwrap();
        assert!(ctx
            .store
            .key_exists(&keys::jobs_paused(&ctx.namespace, "email"))
            .await
            .unwrap());
        enqueuer.set_paused("email", false).await.unwrap();
        assert!(!ctx
            .store
            .key_exists(&keys::jobs_paused(&ctx.namespace, "email"))
            .await
            .unwrap());
    }
}

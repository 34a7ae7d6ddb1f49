//! Best-effort per-worker "current job" records for admin tooling.
//!
//! Writes here are advisory: a failure is logged and execution continues.

use crate::job::{now_epoch_seconds, Job};
use crate::keys;
use crate::store::JobStore;

pub(crate) struct Observer {
    key: String,
    store: JobStore,
}

impl Observer {
    pub fn new(namespace: &str, pool_id: &str, worker_id: &str, store: JobStore) -> Self {
        Self {
            key: keys::observation(namespace, pool_id, worker_id),
            store,
        }
    }

    pub async fn observe_started(&mut self, job: &Job) {
        let args_json = serde_json::to_string(&job.args).unwrap_or_default();
        let fields = [
            ("job_name", job.name.clone()),
            ("job_id", job.id.clone()),
            ("started_at", now_epoch_seconds().to_string()),
            ("args_json", args_json),
        ];
        if let Err(err) = self.store.write_observation(&self.key, &fields).await {
            tracing::warn!(job_id = %job.id, "observation write failed: {err}");
        }
    }

    pub async fn observe_done(&mut self, job: &Job) {
        if let Err(err) = self.store.clear_observation(&self.key).await {
            tracing::warn!(job_id = %job.id, "observation clear failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    #[tokio::test]
    async fn observation_records_current_job_and_clears() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut observer = Observer::new(&ctx.namespace, "p1", "w1", ctx.store.clone());
        let key = keys::observation(&ctx.namespace, "p1", "w1");

        let mut job = Job::new("email", json!({ "to": "a@b.c" }).as_object().unwrap().clone());
        job.id = "job-1".into();
        observer.observe_started(&job).await;

        let seen = ctx.store.read_hash(&key).await.unwrap();
        assert_eq!(seen.get("job_name").map(String::as_str), Some("email"));
        assert_eq!(seen.get("job_id").map(String::as_str), Some("job-1"));
        assert!(seen.contains_key("started_at"));
        assert_eq!(
            seen.get("args_json").map(String::as_str),
            Some(r#"{"to":"a@b.c"}"#)
        );

        observer.observe_done(&job).await;
        assert!(!ctx.store.key_exists(&key).await.unwrap());
    }
}

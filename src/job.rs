//! The persisted job envelope and failure bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Returned by a handler to send a job straight to the dead set regardless of
/// remaining retries. Detected by downcast in the routing path.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct NoRetry(pub String);

impl NoRetry {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Computes the number of seconds until a failed job's next attempt.
pub type BackoffCalculator = Arc<dyn Fn(&Job) -> i64 + Send + Sync>;

/// The serialized envelope stored in pending lists, in-progress lists and the
/// retry/scheduled/dead sorted sets. Unknown fields are tolerated on decode;
/// zero-valued optionals are omitted on encode so a given logical job always
/// serializes to the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, Value>,
    /// Enqueue time, epoch seconds.
    #[serde(rename = "t")]
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fails: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_at: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub scheduled_at: i64,

    /// Payload bytes exactly as fetched; used for LREM against the
    /// in-progress list, which matches by value.
    #[serde(skip)]
    pub(crate) raw: Option<String>,
    /// Pending list this job was popped from.
    #[serde(skip)]
    pub(crate) dequeued_from: Option<String>,
    /// In-progress list this job currently sits in.
    #[serde(skip)]
    pub(crate) in_progress_queue: Option<String>,
    /// Cancelled when the runtime gives up on this invocation (timeout or
    /// shutdown). Handlers are never force-killed; long-running ones should
    /// poll this to exit early.
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

pub(crate) fn now_epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

impl Job {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            id: Self::new_id(),
            args,
            enqueued_at: now_epoch_seconds(),
            fails: 0,
            err: None,
            failed_at: 0,
            unique: false,
            scheduled_at: 0,
            raw: None,
            dequeued_from: None,
            in_progress_queue: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Typed accessor into `args`.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn serialize(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn deserialize(
        raw: &str,
        dequeued_from: String,
        in_progress_queue: String,
    ) -> anyhow::Result<Self> {
        let mut job: Job = serde_json::from_str(raw)?;
        job.raw = Some(raw.to_string());
        job.dequeued_from = Some(dequeued_from);
        job.in_progress_queue = Some(in_progress_queue);
        Ok(job)
    }

    pub(crate) fn fail(&mut self, err: &str) {
        self.fails += 1;
        self.err = Some(err.to_string());
        self.failed_at = now_epoch_seconds();
    }
}

/// Default backoff: `fails^4 + 15 + rand(0, 30) * (fails + 1)` seconds, an
/// aggressively widening ladder in the style of sidekiq.
pub(crate) fn default_backoff(job: &Job) -> i64 {
    let fails = job.fails;
    let jitter = rand::rng().random_range(0..30);
    fails.pow(4) + 15 + jitter * (fails + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips() {
        let args = json!({ "to": "a@b.c", "retries": 3 });
        let mut job = Job::new("email", args.as_object().unwrap().clone());
        job.scheduled_at = 1_700_000_000;
        job.unique = true;
        let raw = job.serialize().unwrap();
        let back = Job::deserialize(&raw, "q".into(), "p".into()).unwrap();
        assert_eq!(back.name, "email");
        assert_eq!(back.id, job.id);
        assert_eq!(back.arg("to"), Some(&json!("a@b.c")));
        assert_eq!(back.scheduled_at, 1_700_000_000);
        assert!(back.unique);
        assert_eq!(back.raw.as_deref(), Some(raw.as_str()));
    }

    #[test]
    fn envelope_tolerates_unknown_fields() {
        let raw = r#"{"name":"email","id":"a","t":123,"some_future_field":{"x":1}}"#;
        let job = Job::deserialize(raw, "q".into(), "p".into()).unwrap();
        assert_eq!(job.name, "email");
        assert_eq!(job.enqueued_at, 123);
        assert_eq!(job.fails, 0);
        assert!(!job.unique);
    }

    #[test]
    fn envelope_omits_zero_valued_fields() {
        let job = Job::new("email", serde_json::Map::new());
        let raw = job.serialize().unwrap();
        assert!(!raw.contains("fails"));
        assert!(!raw.contains("err"));
        assert!(!raw.contains("failed_at"));
        assert!(!raw.contains("unique"));
        assert!(!raw.contains("scheduled_at"));
        assert!(!raw.contains("args"));
    }

    #[test]
    fn identical_jobs_serialize_identically() {
        let mut a = Job::new("cleanup", serde_json::Map::new());
        a.id = "periodic:cleanup:300".into();
        a.enqueued_at = 300;
        a.scheduled_at = 300;
        let mut b = Job::new("cleanup", serde_json::Map::new());
        b.id = "periodic:cleanup:300".into();
        b.enqueued_at = 300;
        b.scheduled_at = 300;
        assert_eq!(a.serialize().unwrap(), b.serialize().unwrap());
    }

    #[test]
    fn fail_bumps_bookkeeping() {
        let mut job = Job::new("email", serde_json::Map::new());
        job.fail("boom");
        assert_eq!(job.fails, 1);
        assert_eq!(job.err.as_deref(), Some("boom"));
        assert!(job.failed_at > 0);
    }

    #[test]
    fn default_backoff_stays_in_expected_range() {
        let mut job = Job::new("email", serde_json::Map::new());
        job.fails = 2;
        for _ in 0..100 {
            let delay = default_backoff(&job);
            // 2^4 + 15 + [0, 30) * 3
            assert!((31..=118).contains(&delay));
        }
    }

    #[test]
    fn no_retry_downcasts_through_anyhow() {
        let err: anyhow::Error = NoRetry::new("bad input").into();
        assert!(err.downcast_ref::<NoRetry>().is_some());
        assert_eq!(err.to_string(), "bad input");
    }
}

//! Redis key layout. Every key the runtime touches is built here so the
//! naming scheme lives in one place.
//!
//! All keys are scoped by a caller-chosen namespace. Per-name queues live
//! under `jobs:<name>`; the in-progress list is additionally scoped by the
//! pool id since it is the unit of crash recovery.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn namespace_prefix(namespace: &str) -> String {
    if namespace.is_empty() || namespace.ends_with(':') {
        namespace.to_string()
    } else {
        format!("{namespace}:")
    }
}

pub fn jobs(namespace: &str, name: &str) -> String {
    format!("{}jobs:{name}", namespace_prefix(namespace))
}

pub fn jobs_prefix(namespace: &str) -> String {
    format!("{}jobs:", namespace_prefix(namespace))
}

pub fn jobs_paused(namespace: &str, name: &str) -> String {
    format!("{}:paused", jobs(namespace, name))
}

pub fn jobs_lock(namespace: &str, name: &str) -> String {
    format!("{}:lock", jobs(namespace, name))
}

pub fn jobs_lock_info(namespace: &str, name: &str) -> String {
    format!("{}:lock_info", jobs(namespace, name))
}

pub fn jobs_max_concurrency(namespace: &str, name: &str) -> String {
    format!("{}:max_concurrency", jobs(namespace, name))
}

pub fn jobs_in_progress(namespace: &str, pool_id: &str, name: &str) -> String {
    format!("{}:{pool_id}:inprogress", jobs(namespace, name))
}

pub fn retry(namespace: &str) -> String {
    format!("{}retry", namespace_prefix(namespace))
}

pub fn scheduled(namespace: &str) -> String {
    format!("{}scheduled", namespace_prefix(namespace))
}

pub fn dead(namespace: &str) -> String {
    format!("{}dead", namespace_prefix(namespace))
}

pub fn known_jobs(namespace: &str) -> String {
    format!("{}known_jobs", namespace_prefix(namespace))
}

pub fn worker_pools(namespace: &str) -> String {
    format!("{}worker_pools", namespace_prefix(namespace))
}

pub fn heartbeat(namespace: &str, pool_id: &str) -> String {
    format!("{}:{pool_id}:heartbeat", worker_pools(namespace))
}

pub fn observation(namespace: &str, pool_id: &str, worker_id: &str) -> String {
    format!(
        "{}:{pool_id}:observations:{worker_id}",
        worker_pools(namespace)
    )
}

pub fn periodic_lease(namespace: &str) -> String {
    format!("{}periodic_enqueuer:lease", namespace_prefix(namespace))
}

/// Unique-job marker key. The digest input is the canonical JSON of
/// `{args, name}`; `serde_json` maps are sorted, so equal logical jobs
/// always hash identically.
pub fn unique_job(namespace: &str, name: &str, args: &serde_json::Map<String, Value>) -> String {
    let canonical = serde_json::json!({ "args": args, "name": name });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("{}unique:{:x}", namespace_prefix(namespace), digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(jobs("app", "email"), "app:jobs:email");
        assert_eq!(jobs("app:", "email"), "app:jobs:email");
        assert_eq!(jobs("", "email"), "jobs:email");
        assert_eq!(jobs_paused("app", "email"), "app:jobs:email:paused");
        assert_eq!(jobs_lock("app", "email"), "app:jobs:email:lock");
        assert_eq!(jobs_lock_info("app", "email"), "app:jobs:email:lock_info");
        assert_eq!(
            jobs_max_concurrency("app", "email"),
            "app:jobs:email:max_concurrency"
        );
        assert_eq!(
            jobs_in_progress("app", "p1", "email"),
            "app:jobs:email:p1:inprogress"
        );
        assert_eq!(retry("app"), "app:retry");
        assert_eq!(scheduled("app"), "app:scheduled");
        assert_eq!(dead("app"), "app:dead");
        assert_eq!(known_jobs("app"), "app:known_jobs");
        assert_eq!(worker_pools("app"), "app:worker_pools");
        assert_eq!(heartbeat("app", "p1"), "app:worker_pools:p1:heartbeat");
        assert_eq!(
            observation("app", "p1", "w1"),
            "app:worker_pools:p1:observations:w1"
        );
        assert_eq!(periodic_lease("app"), "app:periodic_enqueuer:lease");
    }

    #[test]
    fn unique_key_is_stable_across_arg_order() {
        let a = json!({ "x": 1, "y": "z" });
        let b = json!({ "y": "z", "x": 1 });
        let a = a.as_object().unwrap();
        let b = b.as_object().unwrap();
        assert_eq!(unique_job("app", "index", a), unique_job("app", "index", b));
    }

    #[test]
    fn unique_key_differs_by_name_and_args() {
        let args = json!({ "id": 7 });
        let args = args.as_object().unwrap();
        let empty = serde_json::Map::new();
        let base = unique_job("app", "index", args);
        assert_ne!(base, unique_job("app", "other", args));
        assert_ne!(base, unique_job("app", "index", &empty));
        assert!(base.starts_with("app:unique:"));
    }
}

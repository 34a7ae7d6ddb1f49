//! Shared harness for tests that talk to a live Redis.
//!
//! Tests run against the database named by `TOIL_TEST_REDIS_DSN`
//! (default `redis://localhost:6379/15`), serialized by a global guard and
//! isolated from each other by a per-test namespace.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::store::JobStore;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

pub(crate) struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub namespace: String,
    pub store: JobStore,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let redis_dsn = std::env::var("TOIL_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        let namespace = format!("toil-test-{}", Uuid::new_v4());
        let mut store = JobStore::new(&redis_dsn).await?;
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            namespace,
            store,
        })
    }
}

pub(crate) async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

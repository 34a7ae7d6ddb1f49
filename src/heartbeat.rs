//! Pool liveness advertisement.
//!
//! Each pool writes a heartbeat hash every five seconds (first beat
//! immediately) and registers itself in the pool set. The dead-pool reaper
//! uses these records to find crashed pools; stop removes them.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::HEARTBEAT_PERIOD_SECS;
use crate::job::now_epoch_seconds;
use crate::store::JobStore;

pub(crate) struct Heartbeater {
    namespace: String,
    pool_id: String,
    store: JobStore,
    job_names: Vec<String>,
    concurrency: usize,
    worker_ids: Vec<String>,
    started_at: i64,
    stop_rx: mpsc::Receiver<()>,
}

pub(crate) struct HeartbeaterHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl HeartbeaterHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.handle.await;
    }
}

impl Heartbeater {
    pub fn spawn(
        namespace: String,
        pool_id: String,
        store: JobStore,
        mut job_names: Vec<String>,
        concurrency: usize,
        mut worker_ids: Vec<String>,
    ) -> HeartbeaterHandle {
        job_names.sort();
        worker_ids.sort();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let heartbeater = Self {
            namespace,
            pool_id,
            store,
            job_names,
            concurrency,
            worker_ids,
            started_at: now_epoch_seconds(),
            stop_rx,
        };
        let handle = tokio::spawn(heartbeater.run());
        HeartbeaterHandle { stop_tx, handle }
    }

    async fn run(mut self) {
        loop {
            self.beat().await;
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(HEARTBEAT_PERIOD_SECS)) => {}
            }
        }
        if let Err(err) = self
            .store
            .remove_heartbeat(&self.namespace, &self.pool_id)
            .await
        {
            tracing::error!(pool_id = %self.pool_id, "heartbeat removal failed: {err}");
        }
    }

    async fn beat(&mut self) {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fields = [
            ("heartbeat_at", now_epoch_seconds().to_string()),
            ("started_at", self.started_at.to_string()),
            ("job_names", self.job_names.join(",")),
            ("concurrency", self.concurrency.to_string()),
            ("worker_ids", self.worker_ids.join(",")),
            ("host", host),
            ("pid", std::process::id().to_string()),
        ];
        if let Err(err) = self
            .store
            .write_heartbeat(&self.namespace, &self.pool_id, &fields)
            .await
        {
            tracing::error!(pool_id = %self.pool_id, "heartbeat write failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    #[tokio::test]
    async fn heartbeat_registers_and_stop_unregisters() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let handle = Heartbeater::spawn(
            ctx.namespace.clone(),
            "pool-1".into(),
            ctx.store.clone(),
            vec!["b".into(), "a".into()],
            3,
            vec!["w2".into(), "w1".into()],
        );
        // First beat is immediate.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pools = ctx.store.pool_ids(&ctx.namespace).await.unwrap();
        assert_eq!(pools, vec!["pool-1".to_string()]);
        let beat = ctx
            .store
            .read_heartbeat(&ctx.namespace, "pool-1")
            .await
            .unwrap();
        assert_eq!(beat.get("job_names").map(String::as_str), Some("a,b"));
        assert_eq!(beat.get("worker_ids").map(String::as_str), Some("w1,w2"));
        assert_eq!(beat.get("concurrency").map(String::as_str), Some("3"));
        assert_eq!(beat.get("pid").map(String::as_str), Some(std::process::id().to_string().as_str()));
        assert!(beat.contains_key("heartbeat_at"));
        assert!(beat.contains_key("started_at"));

        handle.stop().await;
        let pools = ctx.store.pool_ids(&ctx.namespace).await.unwrap();
        assert!(pools.is_empty());
        let beat = ctx
            .store
            .read_heartbeat(&ctx.namespace, "pool-1")
            .await
            .unwrap();
        assert!(beat.is_empty());
    }
}

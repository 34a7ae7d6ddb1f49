//! Cron-style periodic enqueueing, coordinated across the fleet.
//!
//! One pool at a time holds a short lease and materializes every firing time
//! over the next two hours as an entry in the scheduled set. Entry ids are
//! deterministic per (name, firing epoch), so leader handover or overlapping
//! runs re-insert the same members and the set converges.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{
    PERIODIC_HORIZON_SECS, PERIODIC_JITTER_SECS, PERIODIC_LEASE_TTL_SECS, PERIODIC_PERIOD_SECS,
};
use crate::job::Job;
use crate::keys;
use crate::store::JobStore;

#[derive(Clone)]
pub(crate) struct PeriodicJob {
    pub name: String,
    pub spec: String,
    pub schedule: Schedule,
}

impl PeriodicJob {
    /// Parses a cron spec (seconds field first). Invalid specs are programmer
    /// error and surface at registration.
    pub fn parse(spec: &str, name: &str) -> Result<Self> {
        let schedule = Schedule::from_str(spec)
            .with_context(|| format!("invalid cron spec {spec:?} for periodic job {name:?}"))?;
        Ok(Self {
            name: name.to_string(),
            spec: spec.to_string(),
            schedule,
        })
    }
}

pub(crate) fn occurrences_between(
    schedule: &Schedule,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    schedule
        .after(&after)
        .take_while(|t| *t <= until)
        .collect()
}

/// The synthetic envelope for one firing. Byte-stable for a given
/// (name, epoch) pair.
pub(crate) fn periodic_envelope(name: &str, epoch: i64) -> Result<(String, i64)> {
    let mut job = Job::new(name, serde_json::Map::new());
    job.id = format!("periodic:{name}:{epoch}");
    job.enqueued_at = epoch;
    job.scheduled_at = epoch;
    Ok((job.serialize()?, epoch))
}

pub(crate) struct PeriodicEnqueuer {
    namespace: String,
    pool_id: String,
    jobs: Vec<PeriodicJob>,
    store: JobStore,
}

pub(crate) struct PeriodicEnqueuerHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicEnqueuerHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.handle.await;
    }
}

impl PeriodicEnqueuer {
    pub fn new(
        namespace: String,
        pool_id: String,
        jobs: Vec<PeriodicJob>,
        store: JobStore,
    ) -> Self {
        Self {
            namespace,
            pool_id,
            jobs,
            store,
        }
    }

    pub fn spawn(self) -> PeriodicEnqueuerHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let mut enqueuer = self;
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = enqueuer.enqueue_once().await {
                    tracing::error!("periodic enqueue pass failed: {err}");
                }
                let jitter = rand::rng().random_range(0..PERIODIC_JITTER_SECS);
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_secs(PERIODIC_PERIOD_SECS + jitter)) => {}
                }
            }
        });
        PeriodicEnqueuerHandle { stop_tx, handle }
    }

    /// One pass: take (or keep) the lease, then materialize the horizon.
    pub async fn enqueue_once(&mut self) -> Result<()> {
        let lease_key = keys::periodic_lease(&self.namespace);
        let is_leader = self
            .store
            .acquire_lease(&lease_key, &self.pool_id, PERIODIC_LEASE_TTL_SECS)
            .await?;
        if !is_leader {
            return Ok(());
        }

        let now = Utc::now();
        let until = now + chrono::Duration::seconds(PERIODIC_HORIZON_SECS);
        for periodic in &self.jobs {
            let mut inserted = 0usize;
            for firing in occurrences_between(&periodic.schedule, now, until) {
                let epoch = firing.timestamp();
                let (payload, score) = periodic_envelope(&periodic.name, epoch)?;
                self.store
                    .add_scheduled_payload(&self.namespace, &payload, score)
                    .await?;
                inserted += 1;
            }
            tracing::debug!(
                name = %periodic.name,
                spec = %periodic.spec,
                inserted,
                "materialized periodic firings"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;
    use chrono::TimeZone;

    #[test]
    fn parse_rejects_bad_specs() {
        assert!(PeriodicJob::parse("not a cron line", "cleanup").is_err());
        assert!(PeriodicJob::parse("0 */5 * * * *", "cleanup").is_ok());
    }

    #[test]
    fn occurrences_cover_the_window() {
        let schedule = Schedule::from_str("0 */5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let until = from + chrono::Duration::seconds(PERIODIC_HORIZON_SECS);
        let firings = occurrences_between(&schedule, from, until);
        // Every five minutes over two hours, exclusive of `from` itself.
        assert_eq!(firings.len(), 24);
        assert_eq!(
            firings.first().unwrap().timestamp() - from.timestamp(),
            300
        );
        assert_eq!(
            firings.last().unwrap().timestamp() - from.timestamp(),
            7200
        );
    }

    #[test]
    fn envelope_is_deterministic_per_firing() {
        let (a, score_a) = periodic_envelope("cleanup", 1_700_000_300).unwrap();
        let (b, score_b) = periodic_envelope("cleanup", 1_700_000_300).unwrap();
        assert_eq!(a, b);
        assert_eq!(score_a, score_b);
        let (c, _) = periodic_envelope("cleanup", 1_700_000_600).unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn two_enqueuers_converge_on_one_set_of_firings() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let ns = ctx.namespace.clone();
        let job = PeriodicJob::parse("0 */5 * * * *", "cleanup").unwrap();

        let mut first =
            PeriodicEnqueuer::new(ns.clone(), "p1".into(), vec![job.clone()], ctx.store.clone());
        first.enqueue_once().await.unwrap();
        let count_after_first = ctx.store.scheduled_count(&ns).await.unwrap();
        assert!(count_after_first >= 23, "expected a ~2h horizon of firings");

        // The second pool is not the leaseholder, so its pass is a no-op.
        let mut second =
            PeriodicEnqueuer::new(ns.clone(), "p2".into(), vec![job.clone()], ctx.store.clone());
        second.enqueue_once().await.unwrap();
        assert_eq!(ctx.store.scheduled_count(&ns).await.unwrap(), count_after_first);

        // Even re-running the leaseholder immediately only re-inserts the
        // same deterministic members.
        first.enqueue_once().await.unwrap();
        let final_count = ctx.store.scheduled_count(&ns).await.unwrap();
        assert!(final_count <= count_after_first + 1);
    }
}

//! Typed access to the shared Redis store.
//!
//! Every multi-step mutation that must be indivisible is either a single Lua
//! script invocation or one MULTI/EXEC pipeline; nothing here relies on
//! pipelining alone for atomicity.

use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::{AsyncCommands, Script};

use crate::constants::{REQUEUE_BATCH, UNIQUE_KEY_TTL_SECS};
use crate::job::{now_epoch_seconds, Job};
use crate::keys;
use crate::sampler::SampledQueue;

const FETCH_JOB_LUA: &str = include_str!("lua/fetch_job.lua");
const REQUEUE_LUA: &str = include_str!("lua/requeue.lua");
const REQUEUE_IN_PROGRESS_LUA: &str = include_str!("lua/requeue_in_progress.lua");
const ENQUEUE_UNIQUE_LUA: &str = include_str!("lua/enqueue_unique.lua");
const ACQUIRE_LEASE_LUA: &str = include_str!("lua/acquire_lease.lua");

/// Destination for a unique enqueue.
pub(crate) enum UniqueDestination {
    Pending,
    Scheduled { score: i64 },
}

#[derive(Clone)]
pub struct JobStore {
    conn: redis::aio::MultiplexedConnection,
    fetch_script: Script,
    requeue_script: Script,
    requeue_in_progress_script: Script,
    enqueue_unique_script: Script,
    lease_script: Script,
}

impl JobStore {
    pub async fn new(redis_dsn: &str) -> Result<Self> {
        let client = redis::Client::open(redis_dsn).context("failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Redis")?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: redis::aio::MultiplexedConnection) -> Self {
        Self {
            conn,
            fetch_script: Script::new(FETCH_JOB_LUA),
            requeue_script: Script::new(REQUEUE_LUA),
            requeue_in_progress_script: Script::new(REQUEUE_IN_PROGRESS_LUA),
            enqueue_unique_script: Script::new(ENQUEUE_UNIQUE_LUA),
            lease_script: Script::new(ACQUIRE_LEASE_LUA),
        }
    }

    // ---- fetch ----

    /// Runs the atomic fetch script over the sampled queues. Returns the
    /// first fetchable job, already moved into its in-progress list with the
    /// locks incremented.
    pub(crate) async fn fetch_job(
        &mut self,
        samples: &[SampledQueue],
        pool_id: &str,
    ) -> Result<Option<Job>> {
        if samples.is_empty() {
            return Ok(None);
        }
        let mut invocation = self.fetch_script.prepare_invoke();
        for sample in samples {
            invocation
                .key(&sample.jobs)
                .key(&sample.in_progress)
                .key(&sample.paused)
                .key(&sample.lock)
                .key(&sample.lock_info)
                .key(&sample.max_concurrency);
        }
        invocation.arg(pool_id);
        let fetched: Option<(String, String, String)> =
            invocation.invoke_async(&mut self.conn).await?;
        match fetched {
            None => Ok(None),
            Some((payload, dequeued_from, in_progress)) => {
                let job = Job::deserialize(&payload, dequeued_from, in_progress)?;
                Ok(Some(job))
            }
        }
    }

    // ---- acknowledgement ----

    /// Removes a fetched job from its in-progress list and decrements the
    /// concurrency locks, in one transaction.
    pub(crate) async fn remove_from_in_progress(
        &mut self,
        namespace: &str,
        pool_id: &str,
        job: &Job,
    ) -> Result<()> {
        let (raw, in_progress) = Self::runtime_refs(job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(in_progress, 1, raw)
            .ignore()
            .decr(keys::jobs_lock(namespace, &job.name), 1)
            .ignore()
            .hincr(keys::jobs_lock_info(namespace, &job.name), pool_id, -1)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    /// Acknowledges a failed job by moving it to the retry set, due
    /// `delay_seconds` from now, atomically with the in-progress removal.
    pub(crate) async fn move_to_retry(
        &mut self,
        namespace: &str,
        pool_id: &str,
        job: &Job,
        delay_seconds: i64,
    ) -> Result<()> {
        let (raw, in_progress) = Self::runtime_refs(job)?;
        let payload = job.serialize()?;
        let score = now_epoch_seconds() + delay_seconds;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(in_progress, 1, raw)
            .ignore()
            .decr(keys::jobs_lock(namespace, &job.name), 1)
            .ignore()
            .hincr(keys::jobs_lock_info(namespace, &job.name), pool_id, -1)
            .ignore()
            .zadd(keys::retry(namespace), payload, score)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    /// Acknowledges an exhausted or unroutable job by moving it to the dead
    /// set, atomically with the in-progress removal.
    pub(crate) async fn move_to_dead(
        &mut self,
        namespace: &str,
        pool_id: &str,
        job: &Job,
    ) -> Result<()> {
        let (raw, in_progress) = Self::runtime_refs(job)?;
        let payload = job.serialize()?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(in_progress, 1, raw)
            .ignore()
            .decr(keys::jobs_lock(namespace, &job.name), 1)
            .ignore()
            .hincr(keys::jobs_lock_info(namespace, &job.name), pool_id, -1)
            .ignore()
            .zadd(keys::dead(namespace), payload, now_epoch_seconds())
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    fn runtime_refs(job: &Job) -> Result<(&str, &str)> {
        let raw = job
            .raw
            .as_deref()
            .context("job was not fetched: missing raw payload")?;
        let in_progress = job
            .in_progress_queue
            .as_deref()
            .context("job was not fetched: missing in-progress queue")?;
        Ok((raw, in_progress))
    }

    pub(crate) async fn delete_unique_marker(&mut self, unique_key: &str) -> Result<()> {
        let _: i64 = self.conn.del(unique_key).await?;
        Ok(())
    }

    // ---- enqueue ----

    /// Appends an envelope to its pending list and records the name as known.
    pub(crate) async fn enqueue(&mut self, namespace: &str, job: &Job) -> Result<()> {
        let payload = job.serialize()?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(keys::jobs(namespace, &job.name), payload)
            .ignore()
            .sadd(keys::known_jobs(namespace), &job.name)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    /// Adds an envelope to the scheduled set with score = its scheduled_at.
    pub(crate) async fn enqueue_scheduled(&mut self, namespace: &str, job: &Job) -> Result<()> {
        let payload = job.serialize()?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(keys::scheduled(namespace), payload, job.scheduled_at)
            .ignore()
            .sadd(keys::known_jobs(namespace), &job.name)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    /// Claims the unique marker for (name, args) and enqueues only when the
    /// marker was newly set. Returns whether the job was accepted.
    pub(crate) async fn enqueue_unique(
        &mut self,
        namespace: &str,
        job: &Job,
        destination: UniqueDestination,
    ) -> Result<bool> {
        let unique_key = keys::unique_job(namespace, &job.name, &job.args);
        let payload = job.serialize()?;
        let (dest_key, mode, score) = match destination {
            UniqueDestination::Pending => (keys::jobs(namespace, &job.name), "lpush", 0),
            UniqueDestination::Scheduled { score } => (keys::scheduled(namespace), "zadd", score),
        };
        let accepted: i64 = self
            .enqueue_unique_script
            .key(unique_key)
            .key(dest_key)
            .key(keys::known_jobs(namespace))
            .arg(payload)
            .arg(UNIQUE_KEY_TTL_SECS)
            .arg(&job.name)
            .arg(mode)
            .arg(score)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(accepted == 1)
    }

    /// Inserts a pre-built envelope into the scheduled set. Re-inserting the
    /// same payload is a no-op apart from the score write, which is what
    /// makes the periodic enqueuer idempotent.
    pub(crate) async fn add_scheduled_payload(
        &mut self,
        namespace: &str,
        payload: &str,
        score: i64,
    ) -> Result<()> {
        self.add_payload_to_zset(&keys::scheduled(namespace), payload, score)
            .await
    }

    pub(crate) async fn add_payload_to_zset(
        &mut self,
        zset_key: &str,
        payload: &str,
        score: i64,
    ) -> Result<()> {
        let _: i64 = self.conn.zadd(zset_key, payload, score).await?;
        Ok(())
    }

    // ---- requeuers / reaper ----

    /// Promotes due entries from `zset_key` back into their pending lists.
    pub(crate) async fn requeue_due(
        &mut self,
        namespace: &str,
        zset_key: &str,
        known_names: &[String],
    ) -> Result<usize> {
        let mut invocation = self.requeue_script.prepare_invoke();
        invocation
            .key(zset_key)
            .arg(now_epoch_seconds())
            .arg(keys::jobs_prefix(namespace))
            .arg(REQUEUE_BATCH);
        for name in known_names {
            invocation.arg(name);
        }
        let moved: usize = invocation.invoke_async(&mut self.conn).await?;
        Ok(moved)
    }

    /// Rehomes one job from a dead pool's in-progress list. Returns the moved
    /// payload, or None when the list is drained.
    pub(crate) async fn requeue_in_progress(
        &mut self,
        namespace: &str,
        dead_pool_id: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let moved: Option<String> = self
            .requeue_in_progress_script
            .key(keys::jobs_in_progress(namespace, dead_pool_id, name))
            .key(keys::jobs(namespace, name))
            .key(keys::jobs_lock(namespace, name))
            .key(keys::jobs_lock_info(namespace, name))
            .arg(dead_pool_id)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(moved)
    }

    // ---- heartbeat / pool membership ----

    pub(crate) async fn write_heartbeat(
        &mut self,
        namespace: &str,
        pool_id: &str,
        fields: &[(&str, String)],
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.hset_multiple(keys::heartbeat(namespace, pool_id), fields)
            .ignore()
            .sadd(keys::worker_pools(namespace), pool_id)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    pub(crate) async fn remove_heartbeat(&mut self, namespace: &str, pool_id: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.del(keys::heartbeat(namespace, pool_id))
            .ignore()
            .srem(keys::worker_pools(namespace), pool_id)
            .ignore();
        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn add_pool_id(&mut self, namespace: &str, pool_id: &str) -> Result<()> {
        let _: i64 = self.conn.sadd(keys::worker_pools(namespace), pool_id).await?;
        Ok(())
    }

    pub(crate) async fn pool_ids(&mut self, namespace: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = self.conn.smembers(keys::worker_pools(namespace)).await?;
        Ok(ids)
    }

    pub(crate) async fn read_heartbeat(
        &mut self,
        namespace: &str,
        pool_id: &str,
    ) -> Result<HashMap<String, String>> {
        let raw: HashMap<String, String> =
            self.conn.hgetall(keys::heartbeat(namespace, pool_id)).await?;
        Ok(raw)
    }

    // ---- registration-time writes ----

    pub(crate) async fn write_known_jobs(&mut self, namespace: &str, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let _: i64 = self.conn.sadd(keys::known_jobs(namespace), names).await?;
        Ok(())
    }

    pub(crate) async fn write_concurrency_controls(
        &mut self,
        namespace: &str,
        controls: &[(String, u32)],
    ) -> Result<()> {
        for (name, max_concurrency) in controls {
            let _: () = self
                .conn
                .set(keys::jobs_max_concurrency(namespace, name), *max_concurrency)
                .await?;
        }
        Ok(())
    }

    /// Sets or clears the pause flag the fetch script honors.
    pub async fn set_paused(&mut self, namespace: &str, name: &str, paused: bool) -> Result<()> {
        let key = keys::jobs_paused(namespace, name);
        if paused {
            let _: () = self.conn.set(key, 1).await?;
        } else {
            let _: i64 = self.conn.del(key).await?;
        }
        Ok(())
    }

    // ---- leases ----

    pub(crate) async fn acquire_lease(
        &mut self,
        lease_key: &str,
        owner: &str,
        ttl_seconds: u64,
    ) -> Result<bool> {
        let acquired: i64 = self
            .lease_script
            .key(lease_key)
            .arg(owner)
            .arg(ttl_seconds)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(acquired == 1)
    }

    // ---- observations ----

    pub(crate) async fn write_observation(
        &mut self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<()> {
        let _: () = self.conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub(crate) async fn clear_observation(&mut self, key: &str) -> Result<()> {
        let _: i64 = self.conn.del(key).await?;
        Ok(())
    }

    // ---- introspection (admin tooling and tests) ----

    pub async fn known_job_names(&mut self, namespace: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.conn.smembers(keys::known_jobs(namespace)).await?;
        names.sort();
        Ok(names)
    }

    pub async fn pending_count(&mut self, namespace: &str, name: &str) -> Result<i64> {
        let count: i64 = self.conn.llen(keys::jobs(namespace, name)).await?;
        Ok(count)
    }

    pub async fn in_progress_count(
        &mut self,
        namespace: &str,
        pool_id: &str,
        name: &str,
    ) -> Result<i64> {
        let count: i64 = self
            .conn
            .llen(keys::jobs_in_progress(namespace, pool_id, name))
            .await?;
        Ok(count)
    }

    pub async fn lock_count(&mut self, namespace: &str, name: &str) -> Result<i64> {
        let count: Option<i64> = self.conn.get(keys::jobs_lock(namespace, name)).await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn retry_count(&mut self, namespace: &str) -> Result<i64> {
        let count: i64 = self.conn.zcard(keys::retry(namespace)).await?;
        Ok(count)
    }

    pub async fn scheduled_count(&mut self, namespace: &str) -> Result<i64> {
        let count: i64 = self.conn.zcard(keys::scheduled(namespace)).await?;
        Ok(count)
    }

    pub async fn dead_count(&mut self, namespace: &str) -> Result<i64> {
        let count: i64 = self.conn.zcard(keys::dead(namespace)).await?;
        Ok(count)
    }

    /// Entries of a sorted set with their scores, due-order. Decodes each
    /// payload into a Job alongside its score.
    pub async fn zset_jobs(&mut self, zset_key: &str) -> Result<Vec<(Job, i64)>> {
        let raw: Vec<(String, i64)> = self
            .conn
            .zrangebyscore_withscores(zset_key, "-inf", "+inf")
            .await?;
        let mut jobs = Vec::with_capacity(raw.len());
        for (payload, score) in raw {
            let job: Job = serde_json::from_str(&payload)?;
            jobs.push((job, score));
        }
        Ok(jobs)
    }

    #[cfg(test)]
    pub(crate) async fn read_hash(&mut self, key: &str) -> Result<HashMap<String, String>> {
        let raw: HashMap<String, String> = self.conn.hgetall(key).await?;
        Ok(raw)
    }

    #[cfg(test)]
    pub(crate) async fn key_exists(&mut self, key: &str) -> Result<bool> {
        let exists: bool = self.conn.exists(key).await?;
        Ok(exists)
    }

    #[cfg(test)]
    pub(crate) async fn push_pending_payload(
        &mut self,
        namespace: &str,
        name: &str,
        payload: &str,
    ) -> Result<()> {
        let _: i64 = self.conn.lpush(keys::jobs(namespace, name), payload).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn flushdb(&mut self) -> Result<()> {
        let _: () = redis::cmd("FLUSHDB").query_async(&mut self.conn).await?;
        Ok(())
    }
}

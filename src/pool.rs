//! The worker pool: registration surface plus lifecycle of every background
//! task (workers, heartbeater, requeuers, reaper, periodic enqueuer).
//!
//! Registration must complete before [`WorkerPool::start`]; the registry is
//! composed and frozen at that point and shared immutably by the workers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::constants::DRAIN_JOB_PREFIX;
use crate::heartbeat::{Heartbeater, HeartbeaterHandle};
use crate::job::Job;
use crate::keys;
use crate::periodic::{PeriodicEnqueuer, PeriodicEnqueuerHandle, PeriodicJob};
use crate::reaper::{DeadPoolReaper, ReaperHandle};
use crate::registry::{JobOptions, Next, Registry};
use crate::requeuer::{Requeuer, RequeuerHandle};
use crate::store::JobStore;
use crate::worker::{Worker, WorkerHandle};

type DrainTargets = Arc<Mutex<HashMap<String, mpsc::Sender<oneshot::Sender<()>>>>>;

pub struct WorkerPool<C>
where
    C: Default + Send + Sync + 'static,
{
    pool_id: String,
    namespace: String,
    concurrency: usize,
    store: JobStore,
    registry: Registry<C>,
    periodic_jobs: Vec<PeriodicJob>,
    started: bool,
    workers: Vec<WorkerHandle>,
    heartbeater: Option<HeartbeaterHandle>,
    retrier: Option<RequeuerHandle>,
    scheduler: Option<RequeuerHandle>,
    reaper: Option<ReaperHandle>,
    periodic_enqueuer: Option<PeriodicEnqueuerHandle>,
}

impl<C> WorkerPool<C>
where
    C: Default + Send + Sync + 'static,
{
    pub async fn new(
        namespace: impl Into<String>,
        concurrency: usize,
        redis_dsn: &str,
    ) -> Result<Self> {
        let store = JobStore::new(redis_dsn).await?;
        Ok(Self::with_store(namespace, concurrency, store))
    }

    pub fn with_store(namespace: impl Into<String>, concurrency: usize, store: JobStore) -> Self {
        assert!(concurrency > 0, "worker pool concurrency must be positive");
        Self {
            pool_id: Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            concurrency,
            store,
            registry: Registry::default(),
            periodic_jobs: Vec::new(),
            started: false,
            workers: Vec::new(),
            heartbeater: None,
            retrier: None,
            scheduler: None,
            reaper: None,
            periodic_enqueuer: None,
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // ---- registration (before start) ----

    fn assert_not_started(&self) {
        assert!(
            !self.started,
            "handlers, middleware and schedules must be registered before the pool starts"
        );
    }

    /// Registers a handler for `name` jobs with default options.
    pub fn job<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.job_with_options(name, JobOptions::default(), handler)
    }

    pub fn job_with_options<F, Fut>(
        &mut self,
        name: &str,
        options: JobOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.register_fn(name, options, handler);
        self
    }

    /// Registers a handler that also receives the per-invocation context.
    pub fn context_job<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Arc<C>, Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.context_job_with_options(name, JobOptions::default(), handler)
    }

    pub fn context_job_with_options<F, Fut>(
        &mut self,
        name: &str,
        options: JobOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Arc<C>, Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.register_context_fn(name, options, handler);
        self
    }

    /// Appends pool-level middleware, run for every job before any
    /// job-specific middleware.
    pub fn middleware<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Arc<Job>, Next<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.add_middleware_fn(middleware);
        self
    }

    pub fn context_middleware<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Arc<C>, Arc<Job>, Next<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.add_context_middleware_fn(middleware);
        self
    }

    /// Appends a pool-level hook, run after every handler with the final
    /// context and the outcome.
    pub fn hook<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Arc<C>, Arc<Job>, Option<Arc<anyhow::Error>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.add_hook_fn(hook);
        self
    }

    /// Appends middleware that runs only for `name` jobs, after the pool
    /// chain. The job must already be registered.
    pub fn job_middleware<F, Fut>(&mut self, name: &str, middleware: F) -> &mut Self
    where
        F: Fn(Arc<Job>, Next<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.job_middleware_fn(name, middleware);
        self
    }

    pub fn job_hook<F, Fut>(&mut self, name: &str, hook: F) -> &mut Self
    where
        F: Fn(Arc<C>, Arc<Job>, Option<Arc<anyhow::Error>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.assert_not_started();
        self.registry.job_hook_fn(name, hook);
        self
    }

    /// Schedules `name` jobs on a cron spec (seconds field first). Pools
    /// sharing a namespace coordinate through a lease so each firing is
    /// enqueued once fleet-wide.
    pub fn periodically_enqueue(&mut self, spec: &str, name: &str) -> &mut Self {
        self.assert_not_started();
        let periodic = PeriodicJob::parse(spec, name).unwrap_or_else(|err| panic!("{err:#}"));
        self.periodic_jobs.push(periodic);
        self
    }

    // ---- lifecycle ----

    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        // The internal drain job targets a single worker by id. Channels
        // only exist once workers are spawned, so the handler resolves them
        // through a shared map filled in below.
        let drain_targets: DrainTargets = Arc::new(Mutex::new(HashMap::new()));
        let drain_job_name = format!("{DRAIN_JOB_PREFIX}{}", self.pool_id);
        let targets = drain_targets.clone();
        self.registry.register_fn(
            &drain_job_name,
            JobOptions {
                skip_dead: true,
                ..Default::default()
            },
            move |job| {
                let targets = targets.clone();
                async move {
                    let worker_id = job
                        .arg("worker_id")
                        .and_then(|value| value.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let senders = targets.lock().await;
                    if let Some(drain_tx) = senders.get(&worker_id) {
                        let (ack_tx, _ack_rx) = oneshot::channel();
                        // Not awaited: a worker must be able to drain itself.
                        let _ = drain_tx.try_send(ack_tx);
                    }
                    Ok(())
                }
            },
        );

        let registry = Arc::new(self.registry.compose());
        let job_names = registry.names();
        let concurrency_controls: Vec<(String, u32)> = job_names
            .iter()
            .filter_map(|name| {
                registry
                    .job_type(name)
                    .map(|jt| (name.clone(), jt.options.max_concurrency))
            })
            .collect();
        self.store
            .write_concurrency_controls(&self.namespace, &concurrency_controls)
            .await?;
        self.store
            .write_known_jobs(&self.namespace, &job_names)
            .await?;

        let retry_on_start = job_names.iter().any(|name| {
            registry
                .job_type(name)
                .map(|jt| jt.options.retry_on_start)
                .unwrap_or(false)
        });
        let mut reaper = DeadPoolReaper::new(
            self.namespace.clone(),
            self.pool_id.clone(),
            job_names.clone(),
            self.store.clone(),
        );
        if retry_on_start {
            // Recover a crashed predecessor's in-progress jobs immediately
            // instead of waiting out the reap interval.
            if let Err(err) = reaper.reap().await {
                tracing::error!("startup reap failed: {err}");
            }
        }

        let mut worker_ids = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let worker_id = Uuid::new_v4().to_string();
            worker_ids.push(worker_id.clone());
            let handle = Worker::spawn(
                self.namespace.clone(),
                self.pool_id.clone(),
                worker_id.clone(),
                self.store.clone(),
                registry.clone(),
            );
            drain_targets
                .lock()
                .await
                .insert(worker_id, handle.controls.drain_tx.clone());
            self.workers.push(handle);
        }

        self.heartbeater = Some(Heartbeater::spawn(
            self.namespace.clone(),
            self.pool_id.clone(),
            self.store.clone(),
            job_names.clone(),
            self.concurrency,
            worker_ids,
        ));
        self.retrier = Some(Requeuer::spawn(
            self.namespace.clone(),
            keys::retry(&self.namespace),
            job_names.clone(),
            self.store.clone(),
        ));
        self.scheduler = Some(Requeuer::spawn(
            self.namespace.clone(),
            keys::scheduled(&self.namespace),
            job_names.clone(),
            self.store.clone(),
        ));
        self.reaper = Some(reaper.spawn());
        if !self.periodic_jobs.is_empty() {
            self.periodic_enqueuer = Some(
                PeriodicEnqueuer::new(
                    self.namespace.clone(),
                    self.pool_id.clone(),
                    self.periodic_jobs.clone(),
                    self.store.clone(),
                )
                .spawn(),
            );
        }

        self.started = true;
        tracing::info!(
            pool_id = %self.pool_id,
            namespace = %self.namespace,
            concurrency = self.concurrency,
            "worker pool started"
        );
        Ok(())
    }

    /// Stops all workers and background tasks. Each in-flight handler is
    /// given until completion or its timeout, whichever comes first.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for worker in self.workers.drain(..) {
            let _ = worker.controls.stop_tx.send(()).await;
            let _ = worker.handle.await;
        }
        if let Some(heartbeater) = self.heartbeater.take() {
            heartbeater.stop().await;
        }
        if let Some(retrier) = self.retrier.take() {
            retrier.stop().await;
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
        if let Some(reaper) = self.reaper.take() {
            reaper.stop().await;
        }
        if let Some(periodic) = self.periodic_enqueuer.take() {
            periodic.stop().await;
        }
        tracing::info!(pool_id = %self.pool_id, "worker pool stopped");
    }

    /// Forcibly releases the named worker from a long-running handler. The
    /// invocation's outcome is discarded and its in-progress entry is left
    /// behind for the dead pool reaper. Blocks until the worker
    /// acknowledges, which only happens while a job is executing.
    pub async fn clear_worker(&mut self, worker_id: &str) -> bool {
        for worker in &self.workers {
            if worker.controls.worker_id == worker_id {
                let (ack_tx, ack_rx) = oneshot::channel();
                if worker.controls.clear_tx.send(ack_tx).await.is_ok() {
                    let _ = ack_rx.await;
                    return true;
                }
            }
        }
        false
    }

    /// Worker ids of this pool, available after start.
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|worker| worker.controls.worker_id.clone())
            .collect()
    }

    /// Blocks until every worker has observed an empty fetch, i.e. this
    /// pool's view of its pending lists is drained.
    pub async fn drain(&mut self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (ack_tx, ack_rx) = oneshot::channel();
            if worker.controls.drain_tx.send(ack_tx).await.is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }
}

//! The per-worker execution loop: fetch, run, acknowledge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    FETCH_ERROR_BACKOFF_MS, NO_TIMEOUT_SENTINEL_MS, RUN_JOB_TIMEOUT_ERROR, SLEEP_BACKOFFS_MS,
    STRAY_JOB_ERROR,
};
use crate::job::{default_backoff, Job, NoRetry};
use crate::keys;
use crate::observer::Observer;
use crate::registry::{ComposedJobType, ComposedRegistry};
use crate::sampler::PrioritySampler;
use crate::store::JobStore;

pub(crate) struct Worker<C> {
    worker_id: String,
    namespace: String,
    pool_id: String,
    store: JobStore,
    registry: Arc<ComposedRegistry<C>>,
    sampler: PrioritySampler,
    observer: Observer,
    stop_rx: mpsc::Receiver<()>,
    drain_rx: mpsc::Receiver<oneshot::Sender<()>>,
    clear_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

/// Pool-side endpoints for one worker task.
pub(crate) struct WorkerControls {
    pub worker_id: String,
    pub stop_tx: mpsc::Sender<()>,
    pub drain_tx: mpsc::Sender<oneshot::Sender<()>>,
    pub clear_tx: mpsc::Sender<oneshot::Sender<()>>,
}

pub(crate) struct WorkerHandle {
    pub controls: WorkerControls,
    pub handle: JoinHandle<()>,
}

enum Outcome {
    Completed(Result<()>),
    TimedOut,
    Cleared,
}

impl<C> Worker<C>
where
    C: Default + Send + Sync + 'static,
{
    pub fn new(
        namespace: String,
        pool_id: String,
        worker_id: String,
        store: JobStore,
        registry: Arc<ComposedRegistry<C>>,
    ) -> (Self, WorkerControls) {
        let mut sampler = PrioritySampler::default();
        for (name, priority) in registry.priorities() {
            sampler.add(&namespace, &pool_id, &name, priority);
        }
        let observer = Observer::new(&namespace, &pool_id, &worker_id, store.clone());
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        let (clear_tx, clear_rx) = mpsc::channel(1);
        let controls = WorkerControls {
            worker_id: worker_id.clone(),
            stop_tx,
            drain_tx,
            clear_tx,
        };
        let worker = Self {
            worker_id,
            namespace,
            pool_id,
            store,
            registry,
            sampler,
            observer,
            stop_rx,
            drain_rx,
            clear_rx,
        };
        (worker, controls)
    }

    pub fn spawn(
        namespace: String,
        pool_id: String,
        worker_id: String,
        store: JobStore,
        registry: Arc<ComposedRegistry<C>>,
    ) -> WorkerHandle {
        let (worker, controls) = Self::new(namespace, pool_id, worker_id, store, registry);
        let handle = tokio::spawn(worker.run());
        WorkerHandle { controls, handle }
    }

    async fn run(mut self) {
        tracing::debug!(worker_id = %self.worker_id, "worker started");
        let mut delay = Duration::ZERO;
        let mut drain_ack: Option<oneshot::Sender<()>> = None;
        let mut consecutive_idle: usize = 0;
        loop {
            tokio::select! {
                _ = self.stop_rx.recv() => {
                    tracing::debug!(worker_id = %self.worker_id, "worker stopped");
                    return;
                }
                Some(ack) = self.drain_rx.recv() => {
                    drain_ack = Some(ack);
                    delay = Duration::ZERO;
                }
                _ = tokio::time::sleep(delay) => {
                    match self.fetch().await {
                        Err(err) => {
                            tracing::error!(worker_id = %self.worker_id, "job fetch failed: {err}");
                            delay = Duration::from_millis(FETCH_ERROR_BACKOFF_MS);
                        }
                        Ok(Some(job)) => {
                            consecutive_idle = 0;
                            self.process_job(job).await;
                            delay = Duration::ZERO;
                        }
                        Ok(None) => {
                            if let Some(ack) = drain_ack.take() {
                                let _ = ack.send(());
                            }
                            consecutive_idle += 1;
                            let idx = consecutive_idle.min(SLEEP_BACKOFFS_MS.len() - 1);
                            delay = Duration::from_millis(SLEEP_BACKOFFS_MS[idx]);
                        }
                    }
                }
            }
        }
    }

    async fn fetch(&mut self) -> Result<Option<Job>> {
        let samples = self.sampler.sample().to_vec();
        self.store.fetch_job(&samples, &self.pool_id).await
    }

    async fn process_job(&mut self, mut job: Job) {
        let unique_key = job
            .unique
            .then(|| keys::unique_job(&self.namespace, &job.name, &job.args));

        match self.registry.job_type(&job.name) {
            Some(job_type) => self.run_job(job_type, &mut job).await,
            None => {
                // Without a registered job type there is no retry policy, so
                // the job goes straight to dead.
                tracing::error!(name = %job.name, id = %job.id, "{STRAY_JOB_ERROR}");
                job.fail(STRAY_JOB_ERROR);
                if let Err(err) = self
                    .store
                    .move_to_dead(&self.namespace, &self.pool_id, &job)
                    .await
                {
                    tracing::error!(id = %job.id, "failed to move stray job to dead: {err}");
                }
            }
        }

        if let Some(unique_key) = unique_key {
            if let Err(err) = self.store.delete_unique_marker(&unique_key).await {
                tracing::error!(id = %job.id, "failed to delete unique marker: {err}");
            }
        }
    }

    async fn run_job(&mut self, job_type: Arc<ComposedJobType<C>>, job: &mut Job) {
        let options = job_type.options.clone();
        if options.starting_deadline > 0
            && job.scheduled_at > 0
            && job.scheduled_at < options.starting_deadline
        {
            // Missed its starting window; dropped unrun.
            if let Err(err) = self
                .store
                .remove_from_in_progress(&self.namespace, &self.pool_id, job)
                .await
            {
                tracing::error!(id = %job.id, "failed to drop expired job: {err}");
            }
            return;
        }

        let timeout_ms = if options.timeout_ms > 0 {
            options.timeout_ms
        } else {
            NO_TIMEOUT_SENTINEL_MS
        };
        let timeout = Duration::from_millis(timeout_ms as u64);

        self.observer.observe_started(job).await;

        let token = CancellationToken::new();
        job.cancellation = token.clone();
        let shared = Arc::new(job.clone());
        let ctx = Arc::new(C::default());
        let (result_tx, result_rx) = oneshot::channel();
        let invocation = job_type.invoke(ctx.clone(), shared.clone());
        tokio::spawn(async move {
            let result = invocation.await;
            let _ = result_tx.send(result);
        });

        let outcome = tokio::select! {
            result = result_rx => match result {
                Ok(result) => Outcome::Completed(result),
                // The sender only vanishes if the handler task panicked.
                Err(_) => Outcome::Completed(Err(anyhow::anyhow!("job handler panicked"))),
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            Some(ack) = self.clear_rx.recv() => {
                let _ = ack.send(());
                Outcome::Cleared
            }
        };

        match outcome {
            Outcome::Cleared => {
                // Abandons the invocation and its in-progress entry; the
                // entry is recovered by the dead pool reaper once this
                // pool's heartbeat lapses.
                token.cancel();
                self.observer.observe_done(job).await;
            }
            Outcome::TimedOut => {
                // The handler task keeps running unobserved. Hooks do not
                // run for timed-out jobs.
                token.cancel();
                tracing::warn!(name = %job.name, id = %job.id, "{RUN_JOB_TIMEOUT_ERROR}");
                self.observer.observe_done(job).await;
                job.fail(RUN_JOB_TIMEOUT_ERROR);
                let error = anyhow::anyhow!(RUN_JOB_TIMEOUT_ERROR);
                self.route_failed(&job_type, job, &error).await;
            }
            Outcome::Completed(result) => {
                let error = result.err().map(Arc::new);
                run_hooks(&job_type, ctx, shared, error.clone()).await;
                self.observer.observe_done(job).await;
                match error {
                    None => {
                        if let Err(err) = self
                            .store
                            .remove_from_in_progress(&self.namespace, &self.pool_id, job)
                            .await
                        {
                            tracing::error!(id = %job.id, "failed to ack completed job: {err}");
                        }
                    }
                    Some(error) => {
                        job.fail(&error.to_string());
                        self.route_failed(&job_type, job, &error).await;
                    }
                }
            }
        }
    }

    /// Retry-or-dead routing for a failed job.
    async fn route_failed(&mut self, job_type: &ComposedJobType<C>, job: &Job, error: &anyhow::Error) {
        let options = &job_type.options;
        let no_retry = error.downcast_ref::<NoRetry>().is_some();
        let fails_remaining = options.max_fails as i64 - job.fails;
        let result = if fails_remaining > 0 && !no_retry {
            let delay = match &options.backoff {
                Some(backoff) => backoff(job),
                None => default_backoff(job),
            };
            self.store
                .move_to_retry(&self.namespace, &self.pool_id, job, delay)
                .await
        } else if !options.skip_dead {
            self.store
                .move_to_dead(&self.namespace, &self.pool_id, job)
                .await
        } else {
            self.store
                .remove_from_in_progress(&self.namespace, &self.pool_id, job)
                .await
        };
        if let Err(err) = result {
            // The in-progress entry is left in place for the reaper or an
            // operator rather than silently dropping the job.
            tracing::error!(id = %job.id, "failed to route failed job: {err}");
        }
    }
}

async fn run_hooks<C: Send + Sync + 'static>(
    job_type: &ComposedJobType<C>,
    ctx: Arc<C>,
    job: Arc<Job>,
    error: Option<Arc<anyhow::Error>>,
) {
    for hook in job_type.hooks.iter() {
        if let Err(err) = hook.call(ctx.clone(), job.clone(), error.clone()).await {
            tracing::error!(id = %job.id, "job hook failed: {err}");
        }
    }
}

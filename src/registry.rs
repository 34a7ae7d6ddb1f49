//! Handler, middleware, and hook registration.
//!
//! The context type `C` is chosen at pool creation; a fresh value is built
//! per invocation and shared through the chain. Two registration shapes are
//! supported everywhere: a generic shape that sees only the job, and a
//! context shape that additionally receives the per-invocation context.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::constants::{DEFAULT_MAX_FAILS, DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::job::{BackoffCalculator, Job};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[async_trait]
pub trait Handler<C>: Send + Sync {
    async fn call(&self, ctx: Arc<C>, job: Arc<Job>) -> Result<()>;
}

#[async_trait]
pub trait Middleware<C>: Send + Sync {
    async fn call(&self, ctx: Arc<C>, job: Arc<Job>, next: Next<C>) -> Result<()>;
}

/// Runs after the handler returns with the final context and the outcome
/// (None on success). Hook errors are logged by the worker, never propagated.
#[async_trait]
pub trait Hook<C>: Send + Sync {
    async fn call(
        &self,
        ctx: Arc<C>,
        job: Arc<Job>,
        error: Option<Arc<anyhow::Error>>,
    ) -> Result<()>;
}

/// Continuation handed to middleware; `run` advances to the next middleware
/// and ultimately the handler.
pub struct Next<C> {
    chain: Arc<[Arc<dyn Middleware<C>>]>,
    handler: Arc<dyn Handler<C>>,
    ctx: Arc<C>,
    job: Arc<Job>,
    index: usize,
}

impl<C: Send + Sync + 'static> Next<C> {
    pub fn run(self) -> BoxFuture<Result<()>> {
        Box::pin(async move {
            if self.index < self.chain.len() {
                let middleware = self.chain[self.index].clone();
                let next = Next {
                    chain: self.chain.clone(),
                    handler: self.handler.clone(),
                    ctx: self.ctx.clone(),
                    job: self.job.clone(),
                    index: self.index + 1,
                };
                middleware.call(self.ctx, self.job, next).await
            } else {
                self.handler.call(self.ctx, self.job).await
            }
        })
    }
}

// Closure adapters, so plain async fns register directly.

struct FnHandler<F>(F);

#[async_trait]
impl<C, F, Fut> Handler<C> for FnHandler<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<Job>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, _ctx: Arc<C>, job: Arc<Job>) -> Result<()> {
        (self.0)(job).await
    }
}

struct FnContextHandler<F>(F);

#[async_trait]
impl<C, F, Fut> Handler<C> for FnContextHandler<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Arc<Job>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: Arc<C>, job: Arc<Job>) -> Result<()> {
        (self.0)(ctx, job).await
    }
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<C, F, Fut> Middleware<C> for FnMiddleware<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<Job>, Next<C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, _ctx: Arc<C>, job: Arc<Job>, next: Next<C>) -> Result<()> {
        (self.0)(job, next).await
    }
}

struct FnContextMiddleware<F>(F);

#[async_trait]
impl<C, F, Fut> Middleware<C> for FnContextMiddleware<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Arc<Job>, Next<C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: Arc<C>, job: Arc<Job>, next: Next<C>) -> Result<()> {
        (self.0)(ctx, job, next).await
    }
}

struct FnHook<F>(F);

#[async_trait]
impl<C, F, Fut> Hook<C> for FnHook<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Arc<Job>, Option<Arc<anyhow::Error>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn call(
        &self,
        ctx: Arc<C>,
        job: Arc<Job>,
        error: Option<Arc<anyhow::Error>>,
    ) -> Result<()> {
        (self.0)(ctx, job, error).await
    }
}

/// Registration-time options for a job name.
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Queue weight, 1..=100000. 0 means default (1).
    pub priority: u32,
    /// Total attempts before a job is routed to dead. 0 means default (4).
    pub max_fails: u32,
    /// Discard exhausted jobs instead of keeping them in the dead set.
    pub skip_dead: bool,
    /// Fleet-wide cap on simultaneous invocations. 0 means unbounded.
    pub max_concurrency: u32,
    pub backoff: Option<BackoffCalculator>,
    /// Epoch seconds; scheduled jobs older than this are dropped unrun.
    pub starting_deadline: i64,
    /// Requeue this pool's orphaned in-progress entries at start.
    pub retry_on_start: bool,
    /// Per-invocation timeout in milliseconds. 0 means effectively none.
    pub timeout_ms: i64,
}

impl JobOptions {
    fn normalized(mut self) -> Self {
        if self.priority == 0 {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.max_fails == 0 {
            self.max_fails = DEFAULT_MAX_FAILS;
        }
        assert!(
            self.priority <= MAX_PRIORITY,
            "job priority must be between 1 and {MAX_PRIORITY}"
        );
        self
    }
}

pub(crate) struct JobType<C> {
    pub name: String,
    pub options: JobOptions,
    pub handler: Arc<dyn Handler<C>>,
    pub middleware: Vec<Arc<dyn Middleware<C>>>,
    pub hooks: Vec<Arc<dyn Hook<C>>>,
}

/// Mutable registration state; frozen into a [`ComposedRegistry`] at pool
/// start, after which it is shared immutably by every worker.
pub(crate) struct Registry<C> {
    pub job_types: HashMap<String, JobType<C>>,
    pub middleware: Vec<Arc<dyn Middleware<C>>>,
    pub hooks: Vec<Arc<dyn Hook<C>>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
            middleware: Vec::new(),
            hooks: Vec::new(),
        }
    }
}

impl<C: Send + Sync + 'static> Registry<C> {
    pub fn register(&mut self, name: &str, options: JobOptions, handler: Arc<dyn Handler<C>>) {
        let options = options.normalized();
        self.job_types.insert(
            name.to_string(),
            JobType {
                name: name.to_string(),
                options,
                handler,
                middleware: Vec::new(),
                hooks: Vec::new(),
            },
        );
    }

    pub fn register_fn<F, Fut>(&mut self, name: &str, options: JobOptions, handler: F)
    where
        F: Fn(Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, options, Arc::new(FnHandler(handler)));
    }

    pub fn register_context_fn<F, Fut>(&mut self, name: &str, options: JobOptions, handler: F)
    where
        F: Fn(Arc<C>, Arc<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, options, Arc::new(FnContextHandler(handler)));
    }

    pub fn add_middleware_fn<F, Fut>(&mut self, middleware: F)
    where
        F: Fn(Arc<Job>, Next<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.middleware.push(Arc::new(FnMiddleware(middleware)));
    }

    pub fn add_context_middleware_fn<F, Fut>(&mut self, middleware: F)
    where
        F: Fn(Arc<C>, Arc<Job>, Next<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.middleware
            .push(Arc::new(FnContextMiddleware(middleware)));
    }

    pub fn add_hook_fn<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Arc<C>, Arc<Job>, Option<Arc<anyhow::Error>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.push(Arc::new(FnHook(hook)));
    }

    pub fn job_middleware_fn<F, Fut>(&mut self, name: &str, middleware: F)
    where
        F: Fn(Arc<Job>, Next<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job_type = self
            .job_types
            .get_mut(name)
            .unwrap_or_else(|| panic!("middleware added for unregistered job '{name}'"));
        job_type.middleware.push(Arc::new(FnMiddleware(middleware)));
    }

    pub fn job_hook_fn<F, Fut>(&mut self, name: &str, hook: F)
    where
        F: Fn(Arc<C>, Arc<Job>, Option<Arc<anyhow::Error>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job_type = self
            .job_types
            .get_mut(name)
            .unwrap_or_else(|| panic!("hook added for unregistered job '{name}'"));
        job_type.hooks.push(Arc::new(FnHook(hook)));
    }

    /// Builds the effective per-job-type chains (pool middleware then job
    /// middleware; likewise for hooks) once, at pool start.
    pub fn compose(&self) -> ComposedRegistry<C> {
        let mut composed = HashMap::new();
        for (name, job_type) in &self.job_types {
            let chain: Vec<Arc<dyn Middleware<C>>> = self
                .middleware
                .iter()
                .chain(job_type.middleware.iter())
                .cloned()
                .collect();
            let hooks: Vec<Arc<dyn Hook<C>>> = self
                .hooks
                .iter()
                .chain(job_type.hooks.iter())
                .cloned()
                .collect();
            composed.insert(
                name.clone(),
                Arc::new(ComposedJobType {
                    options: job_type.options.clone(),
                    handler: job_type.handler.clone(),
                    chain: chain.into(),
                    hooks: hooks.into(),
                }),
            );
        }
        ComposedRegistry { job_types: composed }
    }
}

pub(crate) struct ComposedJobType<C> {
    pub options: JobOptions,
    pub handler: Arc<dyn Handler<C>>,
    pub chain: Arc<[Arc<dyn Middleware<C>>]>,
    pub hooks: Arc<[Arc<dyn Hook<C>>]>,
}

impl<C: Send + Sync + 'static> ComposedJobType<C> {
    /// Entry point for one invocation: threads the job through the
    /// middleware chain into the handler.
    pub fn invoke(&self, ctx: Arc<C>, job: Arc<Job>) -> BoxFuture<Result<()>> {
        Next {
            chain: self.chain.clone(),
            handler: self.handler.clone(),
            ctx,
            job,
            index: 0,
        }
        .run()
    }
}

pub(crate) struct ComposedRegistry<C> {
    job_types: HashMap<String, Arc<ComposedJobType<C>>>,
}

impl<C> ComposedRegistry<C> {
    pub fn job_type(&self, name: &str) -> Option<Arc<ComposedJobType<C>>> {
        self.job_types.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.job_types.keys().cloned().collect()
    }

    pub fn priorities(&self) -> Vec<(String, u32)> {
        self.job_types
            .iter()
            .map(|(name, job_type)| (name.clone(), job_type.options.priority))
            .collect()
    }
}

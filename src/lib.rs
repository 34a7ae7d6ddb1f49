//! toil is a Redis-backed background job processing library.
//!
//! Producers enqueue named jobs with arbitrary JSON arguments; worker pools
//! across one or more processes pull jobs with priority-weighted sampling,
//! run registered handlers through a middleware chain, and handle retries,
//! scheduled execution, cron-style periodic enqueueing, timeouts, dead-letter
//! collection and crash recovery. All coordination happens through the
//! shared store with server-side atomic scripts; execution is at-least-once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use toil::{Enqueuer, JobOptions, WorkerPool};
//!
//! #[derive(Default)]
//! struct AppContext;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut pool: WorkerPool<AppContext> =
//!     WorkerPool::new("myapp", 10, "redis://localhost:6379/0").await?;
//! pool.job("email", |job| async move {
//!     let to = job.arg("to").and_then(|v| v.as_str()).unwrap_or_default();
//!     tracing::info!(%to, "sending email");
//!     Ok(())
//! });
//! pool.job_with_options(
//!     "export",
//!     JobOptions { priority: 10, max_fails: 2, ..Default::default() },
//!     |_job| async move { Ok(()) },
//! );
//! pool.periodically_enqueue("0 */5 * * * *", "cleanup");
//! pool.job("cleanup", |_job| async move { Ok(()) });
//! pool.start().await?;
//!
//! let mut enqueuer = Enqueuer::connect("myapp", "redis://localhost:6379/0").await?;
//! enqueuer
//!     .enqueue("email", serde_json::json!({ "to": "a@b.c" }).as_object().unwrap().clone())
//!     .await?;
//!
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod constants;
mod enqueuer;
mod heartbeat;
mod job;
pub mod keys;
mod observer;
mod periodic;
mod pool;
mod reaper;
mod registry;
mod requeuer;
mod sampler;
mod store;
mod worker;

#[cfg(test)]
mod test_support;

pub use enqueuer::Enqueuer;
pub use job::{BackoffCalculator, Job, NoRetry};
pub use pool::WorkerPool;
pub use registry::{BoxFuture, Handler, Hook, JobOptions, Middleware, Next};
pub use store::JobStore;

//! Asynchronous job dispatch
//!
//! Rebalance decisions run off the caller thread. The policy only needs
//! at-least-once execution; duplicate jobs are harmless because
//! `do_rebalance` discards itself when a rebalance is already in flight.

use futures::future::BoxFuture;

/// A zero-argument unit of work
pub type Job = BoxFuture<'static, ()>;

/// Sink for rebalance decision jobs
pub trait JobExecutor: Send + Sync {
    fn submit(&self, job: Job);
}

/// Executor spawning jobs onto the ambient tokio runtime.
///
/// Must be used from within a runtime context; `submit` panics otherwise,
/// matching `tokio::spawn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl JobExecutor for TokioExecutor {
    fn submit(&self, job: Job) {
        tokio::spawn(job);
    }
}

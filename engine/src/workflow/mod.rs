//! The workflow runtime.
//!
//! Durable, retryable orchestration without an external engine: tasks are
//! polled to completion by per-workflow-ID workers, activities are invoked
//! through a retry policy, and cancellation is a cooperative flag checked
//! at the workflow's sole cancellation point. A deterministic workflow ID
//! routes every submission for the same service onto the same serial
//! queue, so two rollouts of one service can never interleave.

mod registry;
mod retry;
mod router;
mod worker;

use std::marker::PhantomData;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Future;
use tokio::sync::oneshot;
use tracing::warn;

pub use registry::{CancelResult, WorkflowRegistry};
pub use retry::{execute_activity, RetryPolicy};
pub use router::TaskRouter;
pub use worker::{do_work, Worker};

use crate::error::Error;

// Default maximum _total_ time a workflow task is allowed to run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait Task<Ctx>: Send {
    type Output;

    type Error;

    async fn poll(&mut self, ctx: Ctx) -> TaskResult<Self::Output, Self::Error>;
}

#[async_trait]
impl<Ctx, T> Task<Ctx> for Box<T>
where
    Ctx: Send + 'static,
    T: Task<Ctx> + ?Sized,
{
    type Output = T::Output;

    type Error = T::Error;

    async fn poll(&mut self, ctx: Ctx) -> TaskResult<Self::Output, Self::Error> {
        self.as_mut().poll(ctx).await
    }
}

#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum TaskResult<R, E> {
    /// More work needs to be done
    Pending(R),
    /// No further work needed
    Done(R),
    /// Try again later
    TryAgain,
    /// Task has been cancelled
    Cancelled,
    /// Task has failed
    Err(E),
}

impl<R, E> TaskResult<R, E> {
    pub fn ok(self) -> Option<R> {
        match self {
            Self::Pending(r) | Self::Done(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Self::Done(_) | Self::Cancelled | Self::Err(_) => true,
            Self::TryAgain | Self::Pending(_) => false,
        }
    }
}

pub type BoxedTask<Ctx = (), O = ()> = Box<dyn Task<Ctx, Output = O, Error = Error>>;

/// Lift a one-shot future into a [`Task`] that completes on first poll.
/// Workflow bodies are plain async functions; this is how they enter the
/// routed queues.
pub fn run_once<F, Fut, O>(f: F) -> impl Task<(), Output = O, Error = Error>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, Error>> + Send + 'static,
    O: Send + 'static,
{
    RunOnce { f: Some(f), _output: PhantomData }
}

struct RunOnce<F, O> {
    f: Option<F>,
    _output: PhantomData<O>,
}

#[async_trait]
impl<F, Fut, O> Task<()> for RunOnce<F, O>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, Error>> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    type Error = Error;

    async fn poll(&mut self, _ctx: ()) -> TaskResult<Self::Output, Self::Error> {
        match self.f.take() {
            Some(f) => match f().await {
                Ok(output) => TaskResult::Done(output),
                Err(err) => TaskResult::Err(err),
            },
            None => TaskResult::Cancelled,
        }
    }
}

/// Completes when the wrapped task does; lets submitters await workflow
/// completion without holding the worker queue.
pub struct TaskHandle {
    rx: oneshot::Receiver<()>,
}

impl Future for TaskHandle {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

pub struct AndThenNotify<T> {
    inner: T,
    notify: Option<oneshot::Sender<()>>,
}

impl<T> AndThenNotify<T> {
    pub fn after(task: T) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        (Self { inner: task, notify: Some(tx) }, TaskHandle { rx })
    }
}

#[async_trait]
impl<T, Ctx> Task<Ctx> for AndThenNotify<T>
where
    Ctx: Send + 'static,
    T: Task<Ctx>,
{
    type Output = T::Output;

    type Error = T::Error;

    async fn poll(&mut self, ctx: Ctx) -> TaskResult<Self::Output, Self::Error> {
        let out = self.inner.poll(ctx).await;

        if out.is_done() {
            if let Some(notify) = self.notify.take() {
                let _ = notify.send(());
            }
        }

        out
    }
}

pub struct WithTimeout<T> {
    inner: T,
    start: Option<Instant>,
    timeout: Duration,
}

impl<T> WithTimeout<T> {
    pub fn on(timeout: Duration, inner: T) -> Self {
        Self { inner, start: None, timeout }
    }
}

#[async_trait]
impl<T, Ctx> Task<Ctx> for WithTimeout<T>
where
    Ctx: Send + 'static,
    T: Task<Ctx>,
{
    type Output = T::Output;

    type Error = T::Error;

    async fn poll(&mut self, ctx: Ctx) -> TaskResult<Self::Output, Self::Error> {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }

        if Instant::now() - *self.start.as_ref().unwrap() > self.timeout {
            warn!(
                "task has timed out: was running for more than {}s",
                self.timeout.as_secs()
            );
            return TaskResult::Cancelled;
        }

        self.inner.poll(ctx).await
    }
}

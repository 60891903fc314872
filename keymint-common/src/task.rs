//! Named task helpers.
//!
//! Background work is always spawned with a name so joins, panics, and
//! premature exits show up in the logs attributed to the right loop.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownSignal;

/// A spawned task carrying a human-readable name.
///
/// Awaiting a [`NamedTask`] yields its name once the task finishes; panics
/// inside the task are logged rather than propagated.
#[must_use]
pub struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl NamedTask {
    /// Spawn `future` onto the tokio runtime under `name`.
    pub fn spawn(
        name: &'static str,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        let handle = tokio::spawn(future);
        Self { name, handle }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn abort(&self) {
        self.handle.abort()
    }
}

impl Future for NamedTask {
    type Output = &'static str;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let name = self.name;
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(name),
            Poll::Ready(Err(join_err)) => {
                if join_err.is_panic() {
                    error!("Task '{name}' panicked");
                } else {
                    warn!("Task '{name}' was cancelled");
                }
                Poll::Ready(name)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Drive all static tasks until shutdown, then wait up to `shutdown_timeout`
/// for them to finish.
///
/// Static tasks are expected to run for the life of the program; if one
/// finishes early, a shutdown is triggered so the process fails loudly
/// instead of limping along partially.
pub async fn join_all_with_shutdown(
    tasks: Vec<NamedTask>,
    shutdown: ShutdownSignal,
    shutdown_timeout: Duration,
) {
    let mut tasks = tasks.into_iter().collect::<FuturesUnordered<_>>();

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            Some(name) = tasks.next() => {
                warn!("Static task '{name}' finished prematurely; \
                       shutting down");
                shutdown.trigger();
                break;
            }
        }
    }

    let drained = tokio::time::timeout(shutdown_timeout, async {
        while let Some(name) = tasks.next().await {
            info!("Task '{name}' finished");
        }
    })
    .await;
    if drained.is_err() {
        let hung = tasks.iter().map(NamedTask::name).collect::<Vec<_>>();
        error!("Tasks did not finish before the shutdown timeout: {hung:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn premature_finish_triggers_shutdown() {
        let shutdown = ShutdownSignal::new();
        let tasks = vec![NamedTask::spawn("short-lived", async {})];
        join_all_with_shutdown(
            tasks,
            shutdown.clone(),
            Duration::from_secs(5),
        )
        .await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_drain_after_shutdown() {
        let shutdown = ShutdownSignal::new();
        let task_shutdown = shutdown.clone();
        let tasks = vec![NamedTask::spawn("loop", async move {
            task_shutdown.recv().await;
        })];
        shutdown.trigger();
        join_all_with_shutdown(tasks, shutdown, Duration::from_secs(5)).await;
    }
}

//! Long-running async task monitoring.

use eyre::{eyre, Result};
use std::{future::Future, panic, time::Duration};
use tokio::task::{JoinError, JoinSet};

type TaskExit = (&'static str, Result<()>);

/// Supervises the tasks that should live as long as the process: the poller,
/// the reaper and the HTTP listener.
///
/// Any task finishing before shutdown is a fault, reported by
/// [`TaskMonitor::check_tasks`] or [`TaskMonitor::next_exit`]. During
/// shutdown, [`TaskMonitor::join_all`] waits for every task to wind down and
/// aborts whatever is still running once the timeout elapses.
#[derive(Debug, Default)]
pub struct TaskMonitor {
    tasks: JoinSet<TaskExit>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tracing::info!(task = name, "Spawning monitored task");
        self.tasks.spawn(async move { (name, task.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Errors if any monitored task has already finished, with or without an
    /// error. Never blocks.
    pub fn check_tasks(&mut self) -> Result<()> {
        match self.tasks.try_join_next() {
            Some(exit) => Err(Self::early_exit_error(exit)),
            None => Ok(()),
        }
    }

    /// Waits for the first monitored task to exit and turns that exit into an
    /// error. Pending forever when no task was spawned.
    pub async fn next_exit(&mut self) -> eyre::Report {
        match self.tasks.join_next().await {
            Some(exit) => Self::early_exit_error(exit),
            None => std::future::pending().await,
        }
    }

    /// Waits for every task to finish. Tasks still running after `timeout`
    /// are aborted. Task panics are resumed on the calling thread.
    pub async fn join_all(&mut self, timeout: Duration) -> Result<()> {
        let mut first_error = None;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(exit) = self.tasks.join_next().await {
                if let Err(err) = Self::finished(exit) {
                    first_error.get_or_insert(err);
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::error!(
                remaining = self.tasks.len(),
                "Monitored tasks did not finish in time, aborting"
            );
            self.tasks.abort_all();
            while let Some(exit) = self.tasks.join_next().await {
                if let Err(err) = Self::finished(exit) {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finished(exit: Result<TaskExit, JoinError>) -> Result<()> {
        match exit {
            Ok((name, Ok(()))) => {
                tracing::info!(task = name, "Monitored task finished");
                Ok(())
            }
            Ok((name, Err(err))) => Err(err.wrap_err(format!("task {name} failed"))),
            Err(join_err) if join_err.is_cancelled() => Ok(()),
            Err(join_err) => panic::resume_unwind(join_err.into_panic()),
        }
    }

    fn early_exit_error(exit: Result<TaskExit, JoinError>) -> eyre::Report {
        match exit {
            Ok((name, Ok(()))) => eyre!("task {name} exited unexpectedly"),
            Ok((name, Err(err))) => err.wrap_err(format!("task {name} failed")),
            Err(join_err) if join_err.is_cancelled() => eyre!("monitored task was cancelled"),
            Err(join_err) => panic::resume_unwind(join_err.into_panic()),
        }
    }
}

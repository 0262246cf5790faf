//! Periodic background jobs.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// A function run on a fixed interval.
///
/// A run that exceeds `timeout` is abandoned and the next one starts on
/// schedule.
pub struct FuncJob<F> {
    name: String,
    interval: Duration,
    timeout: Option<Duration>,
    run_now: bool,
    func: F,
}

impl<F, Fut, E> FuncJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send,
{
    pub fn new(name: impl Into<String>, interval: Duration, func: F) -> Self {
        Self {
            name: name.into(),
            interval,
            timeout: None,
            run_now: false,
            func,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Also run once at startup instead of waiting a full interval.
    pub fn run_now(mut self, run_now: bool) -> Self {
        self.run_now = run_now;
        self
    }

    pub async fn run_once(&self) -> JobOutcome {
        let started = Instant::now();
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, (self.func)()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(job = %self.name, timeout_secs = limit.as_secs(), "job timed out");
                    return JobOutcome::TimedOut;
                }
            },
            None => (self.func)().await,
        };

        match result {
            Ok(()) => {
                tracing::debug!(job = %self.name, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
                JobOutcome::Succeeded
            }
            Err(e) => {
                tracing::error!(job = %self.name, error = %e, "job failed");
                JobOutcome::Failed(e.to_string())
            }
        }
    }

    /// Runs the job until `shutdown` is cancelled. A run in progress is
    /// dropped on cancellation.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(job = %self.name, interval_secs = self.interval.as_secs(), "starting job");
            if self.run_now {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = self.run_once() => {}
                }
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.run_once() => {}
                }
            }
            tracing::info!(job = %self.name, "job stopped");
        })
    }
}

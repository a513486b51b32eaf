//! Detached background jobs.
//!
//! Side effects that must not block a caller's response (recording session
//! affinity, best-effort conversation deletion) are submitted here. A
//! dispatcher task drains the work queue and spawns each job; failures go to
//! a dedicated error channel whose only consumer is a logging task.

use crate::core::metrics::get_metrics;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

struct Job {
    name: &'static str,
    request_id: String,
    future: BoxFuture<'static, anyhow::Result<()>>,
}

struct JobFailure {
    name: &'static str,
    request_id: String,
    error: anyhow::Error,
}

struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Handle to the background work queue. Cheap to clone.
#[derive(Clone)]
pub struct BackgroundTasks {
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<Pending>,
}

impl BackgroundTasks {
    /// Start the dispatcher and error-logging tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        tokio::spawn(Self::dispatcher(receiver, error_tx, pending.clone()));
        tokio::spawn(Self::error_logger(error_rx));

        Self { sender, pending }
    }

    /// Submit a named job. Never blocks and never fails the caller.
    pub fn submit<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            name,
            request_id: crate::core::logging::get_request_id(),
            future: Box::pin(future),
        };
        if let Err(e) = self.sender.send(job) {
            self.pending.finish_one();
            tracing::warn!(job = e.0.name, "Background queue closed, dropping job");
        }
    }

    /// Number of submitted jobs that have not finished yet.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has finished.
    pub async fn idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn dispatcher(
        mut receiver: mpsc::UnboundedReceiver<Job>,
        error_tx: mpsc::UnboundedSender<JobFailure>,
        pending: Arc<Pending>,
    ) {
        while let Some(job) = receiver.recv().await {
            let error_tx = error_tx.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                if let Err(error) = job.future.await {
                    let _ = error_tx.send(JobFailure {
                        name: job.name,
                        request_id: job.request_id,
                        error,
                    });
                }
                pending.finish_one();
            });
        }
    }

    async fn error_logger(mut error_rx: mpsc::UnboundedReceiver<JobFailure>) {
        while let Some(failure) = error_rx.recv().await {
            get_metrics()
                .background_failures
                .with_label_values(&[failure.name])
                .inc();
            tracing::warn!(
                job = failure.name,
                request_id = %failure.request_id,
                error = %failure.error,
                "Background job failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_submitted_job_runs() {
        let tasks = BackgroundTasks::start();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        tasks.submit("flag", async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        tasks.idle().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_swallowed() {
        let tasks = BackgroundTasks::start();

        tasks.submit("boom", async { Err(anyhow::anyhow!("delete failed")) });
        tasks.submit("ok", async { Ok(()) });

        tasks.idle().await;
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_idle_returns_immediately_without_jobs() {
        let tasks = BackgroundTasks::start();
        tasks.idle().await;
    }
}

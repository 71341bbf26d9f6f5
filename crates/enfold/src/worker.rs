//! Background refresh worker.
//!
//! A long-running consumer of `implicate_refresh` jobs. The claim is atomic
//! (pending → running under the queue's lock), so no job is processed twice
//! concurrently; the refresh operation itself must be idempotent because the
//! queue is at-least-once. Shutdown is a watch signal checked between jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::job::IMPLICATE_REFRESH;
use crate::metrics::MetricsRegistry;
use crate::store::{JobOutcome, JobQueue};

/// The opaque implicate-layer recomputation hook.
#[async_trait]
pub trait ImplicateRefresher: Send + Sync {
    /// Recompute implicate-layer artifacts for the given entities. Must be
    /// idempotent.
    async fn refresh(&self, entity_ids: &[String]) -> Result<()>;
}

/// Queue consumer for implicate-refresh jobs.
pub struct RefreshWorker {
    jobs: Arc<dyn JobQueue>,
    refresher: Arc<dyn ImplicateRefresher>,
    poll_interval: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl RefreshWorker {
    #[must_use]
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        refresher: Arc<dyn ImplicateRefresher>,
        poll_interval: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            jobs,
            refresher,
            poll_interval,
            metrics,
        }
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.jobs.claim_pending(IMPLICATE_REFRESH).await? else {
            return Ok(false);
        };

        let outcome = match self.refresher.refresh(&job.payload).await {
            Ok(()) => {
                self.metrics
                    .increment_counter("refresh_jobs_total", &[("outcome", "done")]);
                JobOutcome::Done
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "implicate refresh failed");
                self.metrics
                    .increment_counter("refresh_jobs_total", &[("outcome", "failed")]);
                JobOutcome::Failed(err.to_string())
            }
        };
        self.jobs.complete(&job.id, outcome).await?;
        Ok(true)
    }

    /// Consume jobs until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_once().await {
                Ok(true) => {} // drain without sleeping
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "refresh worker poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::Error;
    use crate::job::{Job, JobStatus};
    use crate::store::in_memory::MemoryJobQueue;

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ImplicateRefresher for CountingRefresher {
        async fn refresh(&self, _entity_ids: &[String]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::backend("reindex unavailable"))
            } else {
                Ok(())
            }
        }
    }

    fn worker(
        jobs: &Arc<MemoryJobQueue>,
        refresher: Arc<CountingRefresher>,
    ) -> RefreshWorker {
        RefreshWorker::new(
            Arc::clone(jobs) as Arc<dyn JobQueue>,
            refresher,
            Duration::from_millis(5),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_run_once_processes_and_marks_done() {
        let jobs = Arc::new(MemoryJobQueue::new());
        let id = jobs
            .enqueue(Job::new(IMPLICATE_REFRESH, vec!["e-1".to_string()]))
            .await
            .unwrap();
        let refresher = Arc::new(CountingRefresher::default());
        let worker = worker(&jobs, Arc::clone(&refresher));

        assert!(worker.run_once().await.unwrap());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(jobs.get(&id).await.unwrap().unwrap().status, JobStatus::Done);

        // Queue drained.
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_marks_failed_with_error_text() {
        let jobs = Arc::new(MemoryJobQueue::new());
        let id = jobs
            .enqueue(Job::new(IMPLICATE_REFRESH, vec!["e-1".to_string()]))
            .await
            .unwrap();
        let refresher = Arc::new(CountingRefresher {
            fail: true,
            ..CountingRefresher::default()
        });
        let worker = worker(&jobs, refresher);

        assert!(worker.run_once().await.unwrap());
        let job = jobs.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("reindex unavailable"));
    }

    #[tokio::test]
    async fn test_no_job_processed_twice() {
        let jobs = Arc::new(MemoryJobQueue::new());
        for i in 0..3 {
            jobs.enqueue(Job::new(IMPLICATE_REFRESH, vec![format!("e-{i}")]))
                .await
                .unwrap();
        }
        let refresher = Arc::new(CountingRefresher::default());
        let worker = worker(&jobs, Arc::clone(&refresher));

        while worker.run_once().await.unwrap() {}
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let jobs = Arc::new(MemoryJobQueue::new());
        jobs.enqueue(Job::new(IMPLICATE_REFRESH, vec!["e-1".to_string()]))
            .await
            .unwrap();
        let refresher = Arc::new(CountingRefresher::default());
        let worker = Arc::new(worker(&jobs, Arc::clone(&refresher)));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("worker must exit after shutdown signal")
            .unwrap();
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use super::guard::StageGuards;
use crate::error::FeedbackError;
use crate::observability::metrics::Metrics;
use crate::pipeline::{Stage, StageReport, StageRunner};

#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub stage: Stage,
    cancel: CancellationToken,
    metrics: Option<Arc<Metrics>>,
}

impl JobContext {
    #[must_use]
    pub fn new(job_id: Uuid, stage: Stage, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            stage,
            cancel,
            metrics: None,
        }
    }

    /// Attaches the collector that stages report per-item progress to.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }

    /// Job with a fresh ID and its own cancellation token.
    #[must_use]
    pub fn detached(stage: Stage) -> Self {
        Self::new(Uuid::new_v4(), stage, CancellationToken::new())
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stages call this between items.
    ///
    /// # Errors
    /// [`FeedbackError::Cancelled`] once the job (or the process) is shutting down.
    pub fn ensure_active(&self) -> Result<(), FeedbackError> {
        if self.cancel.is_cancelled() {
            Err(FeedbackError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle to a submitted stage run. Dropping it detaches the run.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub stage: Stage,
    handle: JoinHandle<Result<StageReport>>,
}

impl JobHandle {
    /// Waits for the run to finish.
    ///
    /// # Errors
    /// The stage's own error, or a join error if the task panicked.
    pub async fn wait(self) -> Result<StageReport> {
        self.handle
            .await
            .with_context(|| format!("stage task {} did not complete", self.job_id))?
    }
}

#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<dyn StageRunner>,
    guards: Arc<StageGuards>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        runner: Arc<dyn StageRunner>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner,
            guards: Arc::new(StageGuards::new()),
            metrics,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns a run of `stage` and returns immediately.
    pub fn submit(&self, stage: Stage) -> JobHandle {
        let job = JobContext::new(Uuid::new_v4(), stage, self.shutdown.child_token());
        let job_id = job.job_id;
        let scheduler = self.clone();
        let handle = self.tracker.spawn(async move { scheduler.run(job).await });
        JobHandle {
            job_id,
            stage,
            handle,
        }
    }

    /// Runs `job` once its stage guard is free. The guard is held until the run ends.
    ///
    /// # Errors
    /// Whatever the stage returns.
    pub async fn run(&self, job: JobContext) -> Result<StageReport> {
        let job = job.with_metrics(Arc::clone(&self.metrics));
        let span = info_span!("stage", job_id = %job.job_id, stage = %job.stage);
        async move {
            let _guard = self.guards.acquire(job.stage).await;
            let started = Instant::now();

            let outcome = self.runner.run(&job).await;
            self.metrics
                .observe_stage(job.stage, started.elapsed(), &outcome);

            match &outcome {
                Ok(report) => info!(?report, "stage completed"),
                Err(error) => error!(error = ?error, "stage failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    #[must_use]
    pub fn is_running(&self, stage: Stage) -> bool {
        self.guards.is_running(stage)
    }

    /// Cancels every submitted run and waits up to `grace` for them to finish.
    /// Returns `false` if some run was still going when the grace period ran out.
    ///
    /// Submissions made after this call still run but are no longer awaited.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use prometheus::Registry;
    use tokio::sync::{Barrier, Notify};

    use super::*;
    use crate::pipeline::{BackfillReport, DispatchReport, IngestReport};

    fn report_for(stage: Stage) -> StageReport {
        match stage {
            Stage::IngestOrders => StageReport::Ingest(IngestReport::default()),
            Stage::BackfillDetails => StageReport::Backfill(BackfillReport::default()),
            Stage::DispatchNotifications => StageReport::Dispatch(DispatchReport::default()),
        }
    }

    /// Tracks how many runs of each stage overlap.
    #[derive(Default)]
    struct OverlapRunner {
        active: Mutex<HashMap<Stage, usize>>,
        max_active: Mutex<HashMap<Stage, usize>>,
        runs: AtomicUsize,
    }

    impl OverlapRunner {
        fn max_for(&self, stage: Stage) -> usize {
            self.max_active
                .lock()
                .unwrap()
                .get(&stage)
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl StageRunner for OverlapRunner {
        async fn run(&self, job: &JobContext) -> Result<StageReport> {
            {
                let mut active = self.active.lock().unwrap();
                let count = active.entry(job.stage).or_default();
                *count += 1;
                let mut max = self.max_active.lock().unwrap();
                let peak = max.entry(job.stage).or_default();
                *peak = (*peak).max(*count);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.active.lock().unwrap().get_mut(&job.stage).unwrap() -= 1;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(report_for(job.stage))
        }
    }

    /// Every run waits at a shared barrier, so it only completes if two stages overlap.
    struct RendezvousRunner {
        barrier: Barrier,
    }

    #[async_trait]
    impl StageRunner for RendezvousRunner {
        async fn run(&self, job: &JobContext) -> Result<StageReport> {
            self.barrier.wait().await;
            Ok(report_for(job.stage))
        }
    }

    /// Fails (or panics) on the first run, succeeds afterwards.
    struct FlakyRunner {
        calls: AtomicUsize,
        panic_first: bool,
    }

    #[async_trait]
    impl StageRunner for FlakyRunner {
        async fn run(&self, job: &JobContext) -> Result<StageReport> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                if self.panic_first {
                    panic!("stage blew up");
                }
                anyhow::bail!("first run fails");
            }
            Ok(report_for(job.stage))
        }
    }

    fn scheduler(runner: Arc<dyn StageRunner>) -> Scheduler {
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());
        Scheduler::new(runner, metrics, CancellationToken::new())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_stage_submissions_never_overlap() {
        let runner = Arc::new(OverlapRunner::default());
        let scheduler = scheduler(Arc::clone(&runner) as Arc<dyn StageRunner>);

        let handles: Vec<JobHandle> = (0..5)
            .map(|_| scheduler.submit(Stage::BackfillDetails))
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(runner.runs.load(Ordering::SeqCst), 5);
        assert_eq!(runner.max_for(Stage::BackfillDetails), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_stages_run_concurrently() {
        let runner = Arc::new(RendezvousRunner {
            barrier: Barrier::new(2),
        });
        let scheduler = scheduler(runner);

        let ingest = scheduler.submit(Stage::IngestOrders);
        let dispatch = scheduler.submit(Stage::DispatchNotifications);

        let both = async {
            ingest.wait().await.unwrap();
            dispatch.wait().await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("different stages must not serialise");
    }

    #[tokio::test]
    async fn failed_run_releases_guard() {
        let scheduler = scheduler(Arc::new(FlakyRunner {
            calls: AtomicUsize::new(0),
            panic_first: false,
        }));

        assert!(scheduler.submit(Stage::IngestOrders).wait().await.is_err());
        assert!(!scheduler.is_running(Stage::IngestOrders));
        scheduler
            .submit(Stage::IngestOrders)
            .wait()
            .await
            .expect("second run succeeds");
    }

    #[tokio::test]
    async fn panicking_run_releases_guard() {
        let scheduler = scheduler(Arc::new(FlakyRunner {
            calls: AtomicUsize::new(0),
            panic_first: true,
        }));

        let error = scheduler
            .submit(Stage::DispatchNotifications)
            .wait()
            .await
            .expect_err("panic surfaces as join error");
        assert!(error.to_string().contains("did not complete"));

        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.submit(Stage::DispatchNotifications).wait(),
        )
        .await
        .expect("guard released after panic")
        .expect("second run succeeds");
    }

    #[tokio::test]
    async fn submitted_jobs_inherit_shutdown_token() {
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(Metrics::new(Arc::new(Registry::new())).unwrap());

        struct CancelAware;

        #[async_trait]
        impl StageRunner for CancelAware {
            async fn run(&self, job: &JobContext) -> Result<StageReport> {
                job.cancel_token().cancelled().await;
                job.ensure_active()?;
                Ok(report_for(job.stage))
            }
        }

        let scheduler = Scheduler::new(Arc::new(CancelAware), metrics, shutdown.clone());
        let handle = scheduler.submit(Stage::BackfillDetails);
        shutdown.cancel();

        let error = handle.wait().await.expect_err("cancelled");
        assert!(matches!(
            error.downcast_ref::<FeedbackError>(),
            Some(FeedbackError::Cancelled)
        ));
    }

    /// Signals once started, then finishes cleanup some time after cancellation.
    struct SlowShutdownRunner {
        started: Notify,
        finished: AtomicBool,
        ignore_cancel: bool,
    }

    #[async_trait]
    impl StageRunner for SlowShutdownRunner {
        async fn run(&self, job: &JobContext) -> Result<StageReport> {
            self.started.notify_one();
            if self.ignore_cancel {
                tokio::time::sleep(Duration::from_secs(60)).await;
            } else {
                job.cancel_token().cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.finished.store(true, Ordering::SeqCst);
            job.ensure_active()?;
            Ok(report_for(job.stage))
        }
    }

    fn slow_runner(ignore_cancel: bool) -> Arc<SlowShutdownRunner> {
        Arc::new(SlowShutdownRunner {
            started: Notify::new(),
            finished: AtomicBool::new(false),
            ignore_cancel,
        })
    }

    #[tokio::test]
    async fn drain_waits_for_running_job() {
        let runner = slow_runner(false);
        let scheduler = scheduler(Arc::clone(&runner) as Arc<dyn StageRunner>);

        let handle = scheduler.submit(Stage::DispatchNotifications);
        runner.started.notified().await;

        assert!(scheduler.drain(Duration::from_secs(5)).await);
        assert!(runner.finished.load(Ordering::SeqCst));
        assert!(!scheduler.is_running(Stage::DispatchNotifications));
        let error = handle.wait().await.expect_err("cancelled");
        assert!(matches!(
            error.downcast_ref::<FeedbackError>(),
            Some(FeedbackError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn drain_gives_up_after_grace_period() {
        let runner = slow_runner(true);
        let scheduler = scheduler(Arc::clone(&runner) as Arc<dyn StageRunner>);

        let _handle = scheduler.submit(Stage::IngestOrders);
        runner.started.notified().await;

        assert!(!scheduler.drain(Duration::from_millis(50)).await);
        assert!(!runner.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_with_nothing_running_returns_immediately() {
        let scheduler = scheduler(slow_runner(false));

        assert!(scheduler.drain(Duration::from_millis(10)).await);
    }
}

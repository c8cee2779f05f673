#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tt_core::{JobId, JobStatus, now_ms};
use tt_runtime::{ExecutionOutcome, JobExecutor, RuntimeResult, SharedStore};
use tt_storage::JobsListRequest;

const RECLAIM_SCAN_LIMIT: usize = 500;
const PURGE_INTERVAL_MS: i64 = 10 * 60 * 1_000;

#[derive(Clone, Debug)]
pub(crate) struct WorkerSettings {
    pub(crate) poll: Duration,
    pub(crate) max_parallel: usize,
    pub(crate) retention: Duration,
    pub(crate) once: bool,
}

/// Polls the store for pending jobs and runs at most `max_parallel` of them at a time.
pub(crate) struct Worker {
    executor: JobExecutor,
    settings: WorkerSettings,
    in_flight: JoinSet<(JobId, ExecutionOutcome)>,
    running: HashSet<JobId>,
    last_purge_ms: Option<i64>,
}

impl Worker {
    pub(crate) fn new(executor: JobExecutor, settings: WorkerSettings) -> Self {
        Self {
            executor,
            settings,
            in_flight: JoinSet::new(),
            running: HashSet::new(),
            last_purge_ms: None,
        }
    }

    fn store(&self) -> &SharedStore {
        self.executor.store()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.running.len()
    }

    fn spawn(&mut self, job_id: JobId, reclaim: bool) {
        if !self.running.insert(job_id.clone()) {
            return;
        }
        let executor = self.executor.clone();
        self.in_flight.spawn(async move {
            let outcome = if reclaim {
                executor.execute_reclaim(&job_id).await
            } else {
                executor.execute(&job_id).await
            };
            (job_id, outcome)
        });
    }

    /// Jobs left `running` by a previous process are executed again from the start.
    pub(crate) fn reclaim_interrupted(&mut self) -> RuntimeResult<usize> {
        let jobs = self
            .store()
            .with(|store| {
                store.jobs_list(JobsListRequest {
                    statuses: vec![JobStatus::Running],
                    kind: None,
                    limit: RECLAIM_SCAN_LIMIT,
                })
            })?
            .jobs;
        let count = jobs.len();
        for job in jobs {
            info!(job_id = %job.id, previous_runner = ?job.runner, "reclaiming interrupted job");
            self.spawn(job.id, true);
        }
        Ok(count)
    }

    /// Starts pending jobs up to the parallelism limit. Returns how many were started.
    pub(crate) fn fill(&mut self) -> RuntimeResult<usize> {
        let capacity = self.settings.max_parallel.saturating_sub(self.running.len());
        if capacity == 0 {
            return Ok(0);
        }
        // Pending jobs this worker already started may still be listed until they are claimed.
        let limit = capacity + self.running.len();
        let jobs = self
            .store()
            .with(|store| {
                store.jobs_list(JobsListRequest {
                    statuses: vec![JobStatus::Pending],
                    kind: None,
                    limit,
                })
            })?
            .jobs;
        let mut started = 0;
        for job in jobs {
            if started == capacity {
                break;
            }
            if self.running.contains(&job.id) {
                continue;
            }
            debug!(job_id = %job.id, kind = %job.kind, "starting job");
            self.spawn(job.id, false);
            started += 1;
        }
        Ok(started)
    }

    /// Collects every finished run without waiting.
    pub(crate) fn reap(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: Result<(JobId, ExecutionOutcome), tokio::task::JoinError>) {
        match joined {
            Ok((job_id, outcome)) => {
                self.running.remove(&job_id);
                match outcome {
                    ExecutionOutcome::Completed(_) => info!(job_id = %job_id, "job completed"),
                    ExecutionOutcome::Failed { error } => {
                        warn!(job_id = %job_id, error = %error, "job failed");
                    }
                    other => debug!(job_id = %job_id, outcome = ?other, "job run ended"),
                }
            }
            Err(err) => {
                error!(error = %err, "job task panicked");
                self.resync_running();
            }
        }
    }

    /// A panicked task loses its job id; rebuild the set from the live sessions.
    fn resync_running(&mut self) {
        let sessions = self.executor.sessions().clone();
        self.running.retain(|job_id| sessions.is_registered(job_id));
    }

    /// Deletes terminal jobs older than the retention window. A zero window disables purging.
    pub(crate) fn purge_if_due(&mut self) -> RuntimeResult<usize> {
        if self.settings.retention.is_zero() {
            return Ok(0);
        }
        let now = now_ms();
        if self
            .last_purge_ms
            .is_some_and(|last| now.saturating_sub(last) < PURGE_INTERVAL_MS)
        {
            return Ok(0);
        }
        self.last_purge_ms = Some(now);
        let retention_ms = i64::try_from(self.settings.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention_ms);
        let purged = self
            .store()
            .with(|store| store.jobs_purge_terminal(cutoff))?;
        if purged > 0 {
            info!(purged, "purged settled jobs past retention");
        }
        Ok(purged)
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.record(joined);
        }
    }

    /// Main loop. Returns when `shutdown` fires or, with `once`, when the pending queue is empty
    /// and every started job has settled.
    pub(crate) async fn run(&mut self, shutdown: CancellationToken) -> RuntimeResult<()> {
        let reclaimed = self.reclaim_interrupted()?;
        if reclaimed > 0 {
            info!(reclaimed, "re-executing jobs interrupted by a previous runner");
        }

        loop {
            self.reap();
            if let Err(err) = self.purge_if_due() {
                warn!(error = %err, "job retention purge failed");
            }
            let started = match self.fill() {
                Ok(started) => started,
                Err(err) => {
                    warn!(error = %err, "pending job scan failed");
                    0
                }
            };

            if self.settings.once && started == 0 && self.running.is_empty() {
                info!("queue drained");
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll) => {}
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.record(joined);
                }
            }
        }

        info!(in_flight = self.running.len(), "shutting down; interrupted jobs stay running for reclaim");
        for job_id in &self.running {
            self.executor.sessions().cancel(job_id);
        }
        self.drain().await;
        Ok(())
    }
}

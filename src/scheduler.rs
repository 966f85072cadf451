//! Scheduler beat, missed-run recovery, and the worker pool.
//!
//! The beat enqueues each job's most recent occurrence with the dedupe key
//! `job@<unix seconds>`, so restarts and concurrent schedulers never
//! enqueue the same occurrence twice. Missed-run recovery enqueues under
//! the same key, so a recovered occurrence is not run again by the next
//! beat. Workers lease one task at a time,
//! run it under the cycle budget, and report back only after the work
//! finished. Failures are retried by [`RetryPolicy`] according to their
//! [`ErrorClass`]; classes that need a human fail the task immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use sync_harness_core::error::{classify, ErrorClass};
use sync_harness_core::retry::{RetryDecision, RetryPolicy};

use crate::config::Config;
use crate::ingest::{cycle_budget, run_cycle_bounded};
use crate::queue::{EnqueueOutcome, Task, TaskKind};
use crate::schedule::{jobs_from_config, JobDefinition};
use crate::services::Services;

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// How a single task execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retrying { class: ErrorClass, after: Duration },
    Failed { class: ErrorClass },
    /// The lease expired mid-run and another worker owns the task now.
    LeaseLost,
}

pub struct Scheduler {
    services: Arc<Services>,
    jobs: Vec<JobDefinition>,
    policy: RetryPolicy,
}

impl Scheduler {
    pub fn new(services: Arc<Services>, jobs: Vec<JobDefinition>) -> Self {
        let policy = services.config.scheduler.task_policy();
        Self {
            services,
            jobs,
            policy,
        }
    }

    pub fn from_services(services: Arc<Services>) -> Result<Self> {
        let jobs = jobs_from_config(&services.config)?;
        Ok(Self::new(services, jobs))
    }

    pub fn jobs(&self) -> &[JobDefinition] {
        &self.jobs
    }

    /// Enqueue the latest due occurrence of every job without an open task.
    pub async fn beat(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut enqueued = 0;
        for job in &self.jobs {
            let Some(occurrence) = job.schedule.most_recent_at_or_before(now) else {
                continue;
            };
            if self.services.queue.has_open(&job.name).await? {
                continue;
            }
            let key = format!("{}@{}", job.name, occurrence.timestamp());
            if let EnqueueOutcome::Enqueued(_) = self
                .services
                .queue
                .enqueue(&job.name, job.kind, &key, occurrence)
                .await?
            {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Startup recovery for index-feeding jobs.
    ///
    /// A job is overdue when its stored watermark is older than its most
    /// recent scheduled occurrence minus the grace window (or it never
    /// committed). Overdue jobs without an open task are enqueued now under
    /// the occurrence's beat key. An occurrence that already ran to a
    /// terminal state is therefore not recovered again; the job waits for
    /// its next occurrence.
    pub async fn recover_missed(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let grace = to_chrono(Duration::from_secs(
            self.services.config.scheduler.recovery_grace_secs,
        ));
        let mut recovered = Vec::new();

        for job in self.jobs.iter().filter(|j| j.feeds_index) {
            let TaskKind::Ingest(source_type) = job.kind else {
                continue;
            };
            let Some(expected) = job.schedule.most_recent_at_or_before(now) else {
                continue;
            };
            let watermark = self.services.state.raw_watermark(source_type).await?;
            let overdue = watermark.map_or(true, |wm| wm < expected - grace);
            if !overdue || self.services.queue.has_open(&job.name).await? {
                continue;
            }

            let key = format!("{}@{}", job.name, expected.timestamp());
            if let EnqueueOutcome::Enqueued(_) = self
                .services
                .queue
                .enqueue(&job.name, job.kind, &key, now)
                .await?
            {
                warn!(
                    job = %job.name,
                    expected = %expected,
                    watermark = ?watermark,
                    "Missed run detected, enqueued recovery"
                );
                recovered.push(job.name.clone());
            }
        }
        Ok(recovered)
    }

    /// Claim and execute at most one task.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<(Task, TaskOutcome)>> {
        let provisional = to_chrono(Duration::from_secs(
            self.services.config.scheduler.lease_margin_secs,
        ));
        let Some(task) = self
            .services
            .queue
            .dequeue(worker_id, provisional, Utc::now())
            .await?
        else {
            return Ok(None);
        };
        let outcome = self.execute(worker_id, &task).await?;
        Ok(Some((task, outcome)))
    }

    /// Run a task `worker_id` has claimed and report the result.
    ///
    /// Ingest tasks first extend the provisional lease to the cycle budget
    /// plus margin; if that fails the lease is gone and nothing runs.
    pub async fn execute(&self, worker_id: &str, task: &Task) -> Result<TaskOutcome> {
        let queue = &self.services.queue;
        let margin = Duration::from_secs(self.services.config.scheduler.lease_margin_secs);
        info!(task_id = %task.task_id, job = %task.job, attempt = task.attempts, worker = worker_id, "Task started");

        let result = match task.kind {
            TaskKind::Ingest(source_type) => {
                match cycle_budget(&self.services, source_type).await {
                    Ok(budget) => {
                        let until = Utc::now() + to_chrono(budget + margin);
                        if !queue.renew_lease(&task.task_id, worker_id, until).await? {
                            warn!(
                                task_id = %task.task_id,
                                job = %task.job,
                                worker = worker_id,
                                "Lease lost before the cycle started, skipping"
                            );
                            return Ok(TaskOutcome::LeaseLost);
                        }
                        run_cycle_bounded(&self.services, source_type, task.attempts)
                            .await
                            .map(|report| {
                                debug!(task_id = %task.task_id, upserted = report.upserted, "Cycle report");
                            })
                    }
                    Err(e) => Err(e),
                }
            }
            TaskKind::RetentionSweep => self
                .services
                .cache
                .sweep(None, self.services.config.cache.retention_cycles)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                if queue.complete(&task.task_id, worker_id).await? {
                    info!(task_id = %task.task_id, job = %task.job, "Task succeeded");
                    Ok(TaskOutcome::Succeeded)
                } else {
                    Ok(TaskOutcome::LeaseLost)
                }
            }
            Err(e) => {
                let class = classify(&e);
                let message = format!("{e:#}");
                let (retry_at, outcome) = match self.policy.decide(class, task.attempts) {
                    RetryDecision::Retry { after } => (
                        Some(Utc::now() + to_chrono(after)),
                        TaskOutcome::Retrying { class, after },
                    ),
                    RetryDecision::GiveUp => (None, TaskOutcome::Failed { class }),
                };

                if !queue
                    .fail(&task.task_id, worker_id, &message, class, retry_at)
                    .await?
                {
                    return Ok(TaskOutcome::LeaseLost);
                }
                match &outcome {
                    TaskOutcome::Retrying { after, .. } => warn!(
                        task_id = %task.task_id,
                        job = %task.job,
                        attempt = task.attempts,
                        class = %class,
                        retry_in_secs = after.as_secs(),
                        error = %message,
                        "Task failed, will retry"
                    ),
                    _ => error!(
                        task_id = %task.task_id,
                        job = %task.job,
                        attempt = task.attempts,
                        class = %class,
                        error = %message,
                        "Task failed permanently"
                    ),
                }
                Ok(outcome)
            }
        }
    }

    /// Worker loop: claim tasks until `shutdown` flips to `true`.
    ///
    /// A task already running when shutdown is signalled finishes first.
    pub async fn work(self: Arc<Self>, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.services.config.scheduler.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let claimed = match self.run_once(&worker_id).await {
                Ok(claimed) => claimed.is_some(),
                Err(e) => {
                    error!(worker = %worker_id, error = %format!("{e:#}"), "Worker error");
                    false
                }
            };
            if claimed {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(worker = %worker_id, "Worker stopped");
    }

    /// Recover, then beat and reclaim leases until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.services.config.scheduler;
        let tick = Duration::from_millis(config.poll_interval_ms);

        self.services
            .queue
            .reclaim_expired(Utc::now(), config.max_attempts)
            .await?;
        let recovered = self.recover_missed(Utc::now()).await?;
        info!(
            jobs = self.jobs.len(),
            workers = config.workers,
            recovered = recovered.len(),
            "Scheduler started"
        );

        let mut workers = JoinSet::new();
        for n in 0..config.workers {
            let worker_id = format!("{}-{}", hostname_tag(), n);
            workers.spawn(Arc::clone(&self).work(worker_id, shutdown.clone()));
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            if let Err(e) = self.services.queue.reclaim_expired(now, config.max_attempts).await {
                error!(error = %format!("{e:#}"), "Lease reclaim failed");
            }
            match self.beat(now).await {
                Ok(n) if n > 0 => debug!(enqueued = n, "Beat"),
                Ok(_) => {}
                Err(e) => error!(error = %format!("{e:#}"), "Beat failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Shutdown requested, waiting for in-flight tasks");
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

fn hostname_tag() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("pid{}", std::process::id()))
}

/// `shx worker`: run the scheduler and worker pool until Ctrl-C.
pub async fn run_worker(config: Config) -> Result<()> {
    let services = Arc::new(Services::open(config).await?);
    let scheduler = Arc::new(Scheduler::from_services(Arc::clone(&services))?);
    for job in scheduler.jobs() {
        info!(job = %job.name, schedule = %job.schedule, "Registered job");
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    scheduler.run(rx).await?;
    services.close().await;
    Ok(())
}

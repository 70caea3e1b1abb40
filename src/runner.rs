use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::db::Database;
use crate::error::{PipelineError, RepositoryError};
use crate::models::JobStatus;
use crate::pipeline::{Pipeline, PipelineRun};
use crate::scheduler::Scheduler;

const PIPELINE_JOB: &str = "pipeline";

#[derive(Debug)]
pub struct GroupOutcome {
    pub group_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub result: Result<PipelineRun, PipelineError>,
}

/// Entry points for the periodic tick and for manual group runs.
pub struct Runner {
    db: Arc<Database>,
    scheduler: Scheduler,
    pipeline: Arc<Pipeline>,
}

impl Runner {
    pub fn new(db: Arc<Database>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            scheduler: Scheduler::new(db.clone()),
            db,
            pipeline,
        }
    }

    /// Run one group's pipeline, recording it as a job run.
    pub async fn run_group(
        &self,
        group_id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> Result<PipelineRun, PipelineError> {
        let job = self
            .db
            .start_job_run(group_id, PIPELINE_JOB, Utc::now())
            .await?;

        let result = self.pipeline.run(group_id, scheduled_at).await;

        let finished = match &result {
            Ok(_) => {
                self.db
                    .finish_job_run(job.id, JobStatus::Success, Utc::now(), None)
                    .await
            }
            Err(e) => {
                error!("Pipeline for group {} failed: {}", group_id, e);
                let message = e.to_string();
                self.db
                    .finish_job_run(job.id, JobStatus::Failed, Utc::now(), Some(&message))
                    .await
            }
        };
        if let Err(e) = finished {
            error!("Failed to record job run {}: {}", job.id, e);
        }

        result
    }

    /// Claim every schedule due at `now` and spawn one task per due group
    /// into `tasks`. Returns once the tasks are started.
    pub async fn dispatch_due(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<GroupOutcome>,
    ) -> Result<usize, RepositoryError> {
        let due = self.scheduler.tick(now).await?;
        if due.is_empty() {
            debug!("No schedules due at {}", now);
            return Ok(0);
        }
        info!("{} schedules due at {}", due.len(), now);

        let count = due.len();
        for entry in due {
            let runner = Arc::clone(self);
            let group_id = entry.group.id;
            let scheduled_at = entry.scheduled_at;
            tasks.spawn(async move {
                let result = runner.run_group(group_id, scheduled_at).await;
                GroupOutcome {
                    group_id,
                    scheduled_at,
                    result,
                }
            });
        }
        Ok(count)
    }

    /// Claim every schedule due at `now` and wait for all of the runs.
    pub async fn tick_and_dispatch(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<Vec<GroupOutcome>, RepositoryError> {
        let mut tasks = JoinSet::new();
        self.dispatch_due(now, &mut tasks).await?;

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Some(outcome) = joined_outcome(joined) {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }
}

fn joined_outcome(joined: Result<GroupOutcome, JoinError>) -> Option<GroupOutcome> {
    match joined {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!("Group run task did not complete: {}", e);
            None
        }
    }
}

/// Tick every `interval` until `shutdown` flips to true, then wait for the
/// group runs still in flight.
///
/// Group runs are spawned, so a slow group never delays the next tick.
pub async fn start_scheduler(
    runner: Arc<Runner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut running: JoinSet<GroupOutcome> = JoinSet::new();
    info!("Scheduler started, ticking every {:?}", interval);

    loop {
        let ticked = tokio::select! {
            _ = timer.tick() => true,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Some(outcome) = joined_outcome(joined) {
                    if let Err(e) = &outcome.result {
                        error!(
                            "Group {} run for {} failed: {}",
                            outcome.group_id, outcome.scheduled_at, e
                        );
                    }
                }
                false
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                false
            }
        };

        if ticked {
            if let Err(e) = runner.dispatch_due(Utc::now(), &mut running).await {
                error!("Scheduler tick failed: {}", e);
            }
        }
    }

    if !running.is_empty() {
        info!("Waiting for {} group runs to finish", running.len());
    }
    while let Some(joined) = running.join_next().await {
        joined_outcome(joined);
    }

    info!("Scheduler stopped");
}

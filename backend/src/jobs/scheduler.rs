// Job Scheduler - Cron-driven scheduled workflow passes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::workflows::{TickReport, WorkflowEngine, WorkflowError};

pub const WORKFLOW_TICK_JOB: &str = "workflow_tick";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Workflow error: {0}")]
    WorkflowError(#[from] WorkflowError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Six-field cron expression (seconds first)
    pub tick_cron: String,
    /// How many execution logs to keep in memory
    pub log_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            // Every minute, on the minute
            tick_cron: "0 * * * * *".to_string(),
            log_capacity: 100,
        }
    }
}

impl From<&WorkflowConfig> for JobConfig {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            tick_cron: config.tick_cron.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

type LogRing = Arc<RwLock<Vec<JobExecutionLog>>>;

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<WorkflowEngine>,
    config: JobConfig,
    execution_logs: LogRing,
}

impl JobScheduler {
    pub async fn new(engine: Arc<WorkflowEngine>, config: JobConfig) -> JobResult<Self> {
        if config.log_capacity == 0 {
            return Err(JobError::ConfigError("log_capacity must be positive".to_string()));
        }
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_workflow_tick().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_workflow_tick(&self) -> JobResult<()> {
        let cron_expr = self.config.tick_cron.clone();
        let capacity = self.config.log_capacity;
        let engine = self.engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                // Failures are already logged and kept in the ring
                let _ = run_workflow_tick(&engine, &logs, capacity, Utc::now()).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled workflow tick on '{}'", cron_expr);

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        match job_name {
            WORKFLOW_TICK_JOB => {
                run_workflow_tick(&self.engine, &self.execution_logs, self.config.log_capacity, Utc::now())
                    .await?;
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }

        Ok(())
    }
}

/// One scheduled pass, recorded in the log ring whatever the outcome.
pub async fn run_workflow_tick(
    engine: &WorkflowEngine,
    logs: &RwLock<Vec<JobExecutionLog>>,
    capacity: usize,
    now: DateTime<Utc>,
) -> JobResult<TickReport> {
    let log_id = Uuid::new_v4();
    let started_at = Utc::now();

    let result = engine.tick(now).await;
    let completed_at = Utc::now();
    let duration = (completed_at - started_at).num_milliseconds();

    let (status, items_processed, errors) = match &result {
        Ok(report) => {
            let mut errors = Vec::new();
            if report.failed > 0 {
                errors.push(format!("{} executions failed", report.failed));
            }
            if report.errors > 0 {
                errors.push(format!("{} workflows abandoned on store errors", report.errors));
            }
            let status = if errors.is_empty() { JobStatus::Completed } else { JobStatus::PartialFailure };
            (status, i32::try_from(report.slots_fired).unwrap_or(i32::MAX), errors)
        }
        Err(e) => (JobStatus::Failed, 0, vec![e.to_string()]),
    };

    push_log(
        logs,
        capacity,
        JobExecutionLog {
            id: log_id,
            job_name: WORKFLOW_TICK_JOB.to_string(),
            started_at,
            completed_at: Some(completed_at),
            status,
            items_processed,
            errors,
            duration_ms: Some(duration),
        },
    )
    .await;

    match result {
        Ok(report) => {
            info!(
                slots_fired = report.slots_fired,
                slots_lost = report.slots_lost,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "Workflow tick completed"
            );
            Ok(report)
        }
        Err(e) => {
            error!("Workflow tick failed: {}", e);
            Err(e.into())
        }
    }
}

async fn push_log(logs: &RwLock<Vec<JobExecutionLog>>, capacity: usize, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > capacity {
        let excess = logs.len() - capacity;
        logs.drain(..excess);
    }
}

use crate::config::AppConfig;
use crate::error::AppError;
use crate::services::runner::{self, TaskKind};
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct TaskScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl TaskScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule(&self, task: TaskKind, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                match runner::start(state, task) {
                    Ok(run_id) => tracing::info!(task = %task, run_id = %run_id, "Scheduled run started"),
                    Err(AppError::Conflict(_)) => {
                        tracing::warn!(task = %task, "Skipping scheduled run: task already running")
                    }
                    Err(e) => tracing::error!(task = %task, error = %e, "Scheduled run not started"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(task = %task, cron = %cron_expression, "Task scheduled");
        Ok(())
    }

    pub async fn init_schedules(&self, config: &AppConfig) -> anyhow::Result<()> {
        let mut count = 0;
        for (task, cron) in config.schedules() {
            if let Err(e) = self.schedule(task, &cron).await {
                tracing::error!(task = %task, cron = %cron, error = %e, "Failed to schedule task");
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

//! Asynchronous engine runs and their status.
//!
//! Each task kind runs at most once at a time in this process. The engine's
//! run locks still guard against runs started elsewhere, such as the CLI.

use crate::error::AppError;
use crate::state::AppState;
use backup_engine::Engine;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Backup,
    Archive,
    Sweep,
    DbBackup,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Backup => "backup",
            TaskKind::Archive => "archive",
            TaskKind::Sweep => "sweep",
            TaskKind::DbBackup => "db-backup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: Uuid,
    pub task: TaskKind,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl RunStatus {
    fn started(task: TaskKind, run_id: Uuid) -> Self {
        Self {
            run_id,
            task,
            state: RunState::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }
}

/// Latest run per task kind
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<TaskKind, RunStatus>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new run, unless one of the same kind is still running.
    pub fn try_begin(&self, task: TaskKind) -> Option<Uuid> {
        let run_id = Uuid::new_v4();
        match self.runs.entry(task) {
            Entry::Occupied(entry) if entry.get().state == RunState::Running => None,
            Entry::Occupied(mut entry) => {
                entry.insert(RunStatus::started(task, run_id));
                Some(run_id)
            }
            Entry::Vacant(entry) => {
                entry.insert(RunStatus::started(task, run_id));
                Some(run_id)
            }
        }
    }

    pub fn finish(&self, task: TaskKind, run_id: Uuid, outcome: Result<Value, String>) {
        if let Some(mut status) = self.runs.get_mut(&task) {
            if status.run_id != run_id {
                return;
            }
            status.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    status.state = RunState::Succeeded;
                    status.result = Some(result);
                }
                Err(error) => {
                    status.state = RunState::Failed;
                    status.error = Some(error);
                }
            }
        }
    }

    pub fn get(&self, task: TaskKind) -> Option<RunStatus> {
        self.runs.get(&task).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> Vec<RunStatus> {
        let mut runs: Vec<RunStatus> = self.runs.iter().map(|s| s.value().clone()).collect();
        runs.sort_by_key(|s| s.task);
        runs
    }
}

fn report<T: Serialize>(result: backup_engine::Result<T>) -> Result<Value, String> {
    let value = result.map_err(|e| e.to_string())?;
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Run `task` to completion on the calling thread.
pub fn execute(task: TaskKind, engine: &Engine) -> Result<Value, String> {
    match task {
        TaskKind::Backup => report(engine.backup()),
        TaskKind::Archive => report(engine.archive()),
        TaskKind::Sweep => report(engine.sweep()),
        TaskKind::DbBackup => report(engine.backup_db()),
    }
}

/// Start `task` in the background and return its run id.
pub fn start(state: Arc<AppState>, task: TaskKind) -> Result<Uuid, AppError> {
    if task == TaskKind::DbBackup && !state.engine_config.db.enabled {
        return Err(AppError::BadRequest("database backup is not enabled".into()));
    }
    let run_id = state
        .runs
        .try_begin(task)
        .ok_or_else(|| AppError::Conflict(format!("{task} is already running")))?;

    let engine_config = state.engine_config.clone();
    let runs = state.runs.clone();
    tracing::info!(task = %task, run_id = %run_id, "Starting run");

    tokio::spawn(async move {
        let outcome = tokio::task::spawn_blocking(move || {
            let engine = Engine::from_config(engine_config).map_err(|e| e.to_string())?;
            execute(task, &engine)
        })
        .await
        .unwrap_or_else(|e| Err(format!("run aborted: {e}")));

        match &outcome {
            Ok(_) => tracing::info!(task = %task, run_id = %run_id, "Run succeeded"),
            Err(e) => tracing::error!(task = %task, run_id = %run_id, error = %e, "Run failed"),
        }
        runs.finish(task, run_id, outcome);
    });

    Ok(run_id)
}

use crate::services::runner::TaskKind;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Engine TOML file
    pub engine_config: PathBuf,
    /// Bearer token for `/admin`; without one every admin request is refused
    pub admin_token: Option<String>,
    pub backup_cron: Option<String>,
    pub archive_cron: Option<String>,
    pub sweep_cron: Option<String>,
    pub db_backup_cron: Option<String>,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            engine_config: PathBuf::from(
                std::env::var("ENGINE_CONFIG").unwrap_or_else(|_| "/etc/backup-engine/engine.toml".into()),
            ),
            admin_token: non_empty_var("ADMIN_TOKEN"),
            backup_cron: non_empty_var("BACKUP_CRON"),
            archive_cron: non_empty_var("ARCHIVE_CRON"),
            sweep_cron: non_empty_var("SWEEP_CRON"),
            db_backup_cron: non_empty_var("DB_BACKUP_CRON"),
        }
    }

    /// Configured cron expressions (seconds field first).
    pub fn schedules(&self) -> Vec<(TaskKind, String)> {
        [
            (TaskKind::Backup, &self.backup_cron),
            (TaskKind::Archive, &self.archive_cron),
            (TaskKind::Sweep, &self.sweep_cron),
            (TaskKind::DbBackup, &self.db_backup_cron),
        ]
        .into_iter()
        .filter_map(|(task, cron)| cron.clone().map(|c| (task, c)))
        .collect()
    }
}

use crate::config::AppConfig;
use crate::services::runner::RunRegistry;

pub struct AppState {
    pub config: AppConfig,
    /// Engines are built per run from this, on the blocking pool
    pub engine_config: backup_engine::Config,
    pub runs: RunRegistry,
}

impl AppState {
    pub fn new(config: AppConfig, engine_config: backup_engine::Config) -> Self {
        Self {
            config,
            engine_config,
            runs: RunRegistry::new(),
        }
    }
}

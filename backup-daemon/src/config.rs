use backup_engine::Config;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Engine TOML file; defaults apply when unset or missing
    pub engine_config: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

        Self {
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("backup-daemon.db")),
            data_dir,
            engine_config: std::env::var("ENGINE_CONFIG").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").ok(),
        }
    }

    /// Engine configuration: file values, then environment overrides.
    pub fn load_engine_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.engine_config {
            Some(path) if path.exists() => Config::from_file(path)?,
            Some(path) => {
                tracing::warn!(path = %path.display(), "Engine config not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env();
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        Ok(config)
    }
}

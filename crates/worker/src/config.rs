//! Worker configuration, read once from the environment at startup

use anyhow::{bail, Context};

pub const DEFAULT_CRON: &str = "0 * * * * *";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_HTTP_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Six-field cron expression for the due-step job
    pub cron: String,
    /// Max steps executed per run
    pub batch_size: usize,
    pub integration_url: Option<String>,
    pub integration_api_key: Option<String>,
    /// Transport retries for idempotent integration calls
    pub http_retries: usize,
    pub run_migrations: bool,
    pub json_logs: bool,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env("DATABASE_URL").context("DATABASE_URL must be set")?;

        let batch_size = match env("DUNNING_BATCH_SIZE") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("DUNNING_BATCH_SIZE is not a number: {}", raw))?,
            None => DEFAULT_BATCH_SIZE,
        };
        if batch_size == 0 {
            bail!("DUNNING_BATCH_SIZE must be greater than zero");
        }

        let http_retries = match env("DUNNING_HTTP_RETRIES") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("DUNNING_HTTP_RETRIES is not a number: {}", raw))?,
            None => DEFAULT_HTTP_RETRIES,
        };

        let run_migrations = env("DUNNING_RUN_MIGRATIONS")
            .map(|v| v.parse::<bool>().unwrap_or(true))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            cron: env("DUNNING_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string()),
            batch_size,
            integration_url: env("DUNNING_INTEGRATION_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            integration_api_key: env("DUNNING_INTEGRATION_API_KEY"),
            http_retries,
            run_migrations,
            json_logs: env("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }
}

/// Unset and blank are the same thing
fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

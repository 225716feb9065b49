use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use std::{env, time::Duration};

use crate::services::queue_service::WorkerSettings;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_retries: u32,
    pub backoff_step_ms: u64,
    pub batch_max: usize,
    pub pop_timeout_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Tiered retry queue for batched SQL execution")]
pub struct Args {
    /// Host to bind to (overrides SQL_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SQL_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides SQL_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Failures before an item is dead-lettered (overrides SQL_RELAY_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Backoff unit in ms; a retried item waits step * retry_count
    /// (overrides SQL_RELAY_BACKOFF_STEP_MS)
    #[arg(long)]
    pub backoff_step_ms: Option<u64>,

    /// Maximum items per popped batch (overrides SQL_RELAY_BATCH_MAX)
    #[arg(long)]
    pub batch_max: Option<usize>,

    /// How long a pop blocks in ms (overrides SQL_RELAY_POP_TIMEOUT_MS)
    #[arg(long)]
    pub pop_timeout_ms: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("SQL_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("SQL_RELAY_PORT", 3000u16)?;
        let env_db = env::var("SQL_RELAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/sql_relay.db".into());
        let env_max_retries = parse_env("SQL_RELAY_MAX_RETRIES", 5u32)?;
        let env_backoff = parse_env("SQL_RELAY_BACKOFF_STEP_MS", 5000u64)?;
        let env_batch_max = parse_env("SQL_RELAY_BATCH_MAX", 64usize)?;
        let env_pop_timeout = parse_env("SQL_RELAY_POP_TIMEOUT_MS", 250u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            max_retries: args.max_retries.unwrap_or(env_max_retries),
            backoff_step_ms: args.backoff_step_ms.unwrap_or(env_backoff),
            batch_max: args.batch_max.unwrap_or(env_batch_max).max(1),
            pop_timeout_ms: args.pop_timeout_ms.unwrap_or(env_pop_timeout).max(1),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The worker tuning knobs carried by QueueService.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_retries: self.max_retries,
            backoff_step: ChronoDuration::milliseconds(self.backoff_step_ms as i64),
            batch_max: self.batch_max,
            pop_timeout: Duration::from_millis(self.pop_timeout_ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

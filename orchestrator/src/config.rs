use std::path::PathBuf;
use std::time::Duration;

use crate::actors::session::SessionSettings;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Port the HTTP API listens on
    pub port: u16,
    /// Root directory for per-session SQLite files
    pub data_dir: PathBuf,
    pub lease_ttl: Duration,
    /// Zero disables the housekeeping ticker
    pub sweep_interval: Duration,
    /// How long an idle session keeps its actor; zero disables eviction
    pub session_idle_timeout: Duration,
    /// Endpoint that receives started executions; unset means runners poll
    pub runner_url: Option<String>,
    pub stream_base_url: String,
    /// Browser origins allowed by CORS
    pub cors_origins: Vec<String>,
}

impl OrchestratorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let lease_ttl_secs: u64 = env_parse("ORCHESTRATOR_LEASE_TTL_SECS", 60)?;
        if lease_ttl_secs == 0 {
            anyhow::bail!("ORCHESTRATOR_LEASE_TTL_SECS must be greater than zero");
        }

        Ok(Self {
            port: env_parse("ORCHESTRATOR_PORT", 8080)?,
            data_dir: PathBuf::from(env_str("ORCHESTRATOR_DATA_DIR", "./data/sessions")),
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            sweep_interval: Duration::from_secs(env_parse("ORCHESTRATOR_SWEEP_INTERVAL_SECS", 300)?),
            session_idle_timeout: Duration::from_secs(env_parse(
                "ORCHESTRATOR_SESSION_IDLE_SECS",
                1800,
            )?),
            runner_url: std::env::var("ORCHESTRATOR_RUNNER_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            stream_base_url: env_str("ORCHESTRATOR_STREAM_BASE_URL", "http://localhost:8080"),
            cors_origins: env_csv(
                "ORCHESTRATOR_CORS_ORIGINS",
                &["http://localhost:3000", "http://127.0.0.1:3000"],
            ),
        })
    }

    pub fn session_settings(&self) -> anyhow::Result<SessionSettings> {
        Ok(SessionSettings {
            lease_ttl: chrono::Duration::from_std(self.lease_ttl)?,
            sweep_interval: (!self.sweep_interval.is_zero()).then_some(self.sweep_interval),
            stream_base_url: self.stream_base_url.clone(),
            idle_timeout: (!self.session_idle_timeout.is_zero())
                .then_some(self.session_idle_timeout),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

use std::env;

use serde::Deserialize;
use trellis_common::{TrellisError, TrellisResult};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Path to the connector definitions JSON file.
    pub connectors_path: String,
    /// Budget for a single job run pass, in milliseconds. Stale-job cleanup
    /// cancels unfinished jobs not updated for 2x this value.
    pub max_job_duration_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> TrellisResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            host: get_var_or("HOST", "0.0.0.0"),
            port: get_var_or("PORT", "8080")
                .parse()
                .map_err(|e| TrellisError::Config(format!("invalid PORT: {e}")))?,
            log_level: get_var_or("LOG_LEVEL", "info"),
            connectors_path: get_var_or("CONNECTORS_PATH", "connectors.json"),
            max_job_duration_ms: get_var_or("MAX_JOB_DURATION_MS", "60000")
                .parse()
                .map_err(|e| TrellisError::Config(format!("invalid MAX_JOB_DURATION_MS: {e}")))?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn get_var(key: &str) -> TrellisResult<String> {
    env::var(key).map_err(|_| TrellisError::Config(format!("{key} is required but not set")))
}

fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn config_from_env_succeeds_with_required_vars() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::set_var("DATABASE_URL", "postgres://localhost/trellis_test");

        let cfg = AppConfig::from_env().expect("should parse config");
        assert_eq!(cfg.database_url, "postgres://localhost/trellis_test");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.max_job_duration_ms, 60_000);

        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn config_from_env_fails_without_database_url() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::remove_var("DATABASE_URL");
        let result = AppConfig::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn bind_addr_formats_correctly() {
        let cfg = AppConfig {
            database_url: String::new(),
            host: "127.0.0.1".to_owned(),
            port: 3000,
            log_level: "debug".to_owned(),
            connectors_path: "connectors.json".to_owned(),
            max_job_duration_ms: 60_000,
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:3000");
    }
}

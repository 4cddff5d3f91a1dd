//! Connection settings for the orchestrator's PostgreSQL store.
//!
//! Read from `POSTGRES_*` variables. `POSTGRES_URL` wins over the separate
//! host, port, user, password and database settings when present.

use std::str::FromStr;

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL, e.g. `postgres://orch:pw@db:5432/orchestrator`
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,

    /// Upper bound in milliseconds on waiting for a worker lock or a
    /// suspended execution row held by another transaction. Zero waits
    /// forever.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "orchestrator".to_string()
}

fn default_database() -> String {
    "orchestrator".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POSTGRES_").from_env::<DatabaseConfig>()
    }

    /// Connection options tagged with the orchestrator's application name
    /// and lock timeout.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let options = match &self.url {
            Some(url) => PgConnectOptions::from_str(url)?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.database),
        };

        Ok(options
            .application_name("orchestrator")
            .options([("lock_timeout", self.lock_timeout_ms.to_string())]))
    }

    /// Where the pool connects, without credentials.
    pub fn target(&self) -> String {
        match self.connect_options() {
            Ok(options) => format!(
                "{}:{}/{}",
                options.get_host(),
                options.get_port(),
                options.get_database().unwrap_or_default()
            ),
            Err(_) => "invalid POSTGRES_URL".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target() {
        let config = DatabaseConfig::default();
        assert_eq!(config.target(), "localhost:5432/orchestrator");
        assert_eq!(config.lock_timeout_ms, 30_000);
    }

    #[test]
    fn test_url_overrides_separate_settings() {
        let config = DatabaseConfig {
            url: Some("postgres://orch:pw@db.internal:6543/flows".to_string()),
            ..DatabaseConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("flows"));
        assert_eq!(config.target(), "db.internal:6543/flows");
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let config = DatabaseConfig {
            url: Some("not a url".to_string()),
            ..DatabaseConfig::default()
        };
        assert!(config.connect_options().is_err());
        assert_eq!(config.target(), "invalid POSTGRES_URL");
    }
}

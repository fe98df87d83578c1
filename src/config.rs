use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

/// Runtime settings, read from `LOTTERY_*` environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// How often each monitor re-checks undrawn polls.
    pub monitor_interval: Duration,
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    pub pin_max_attempts: u32,
    pub pin_lockout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 5,
            monitor_interval: Duration::from_secs(30),
            store_timeout: Duration::from_millis(5000),
            pin_max_attempts: 5,
            pin_lockout: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let config = Config {
            database_url: env::var("LOTTERY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_max_connections: env_or("LOTTERY_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            monitor_interval: Duration::from_secs(env_or("LOTTERY_MONITOR_INTERVAL_SECS", defaults.monitor_interval.as_secs())?),
            store_timeout: Duration::from_millis(env_or("LOTTERY_STORE_TIMEOUT_MS", defaults.store_timeout.as_millis() as u64)?),
            pin_max_attempts: env_or("LOTTERY_PIN_MAX_ATTEMPTS", defaults.pin_max_attempts)?,
            pin_lockout: Duration::from_secs(env_or("LOTTERY_PIN_LOCKOUT_SECS", defaults.pin_lockout.as_secs())?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.monitor_interval.is_zero() {
            return Err(anyhow!("LOTTERY_MONITOR_INTERVAL_SECS must be at least 1"));
        }
        if self.store_timeout.is_zero() {
            return Err(anyhow!("LOTTERY_STORE_TIMEOUT_MS must be at least 1"));
        }
        if self.pin_max_attempts == 0 {
            return Err(anyhow!("LOTTERY_PIN_MAX_ATTEMPTS must be at least 1"));
        }
        if self.db_max_connections == 0 {
            return Err(anyhow!("LOTTERY_DB_MAX_CONNECTIONS must be at least 1"));
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url.as_deref().ok_or_else(|| anyhow!("expected LOTTERY_DATABASE_URL"))
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse::<T>().with_context(|| format!("{} is invalid: '{}'", name, v)),
        _ => Ok(default),
    }
}

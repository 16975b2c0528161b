use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::auth::TokenConfig;
use crate::room::RoomStoreSettings;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Process configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub host: String,
    pub port: u16,
    /// Durable storage; the in-memory repository is used when unset
    pub database_url: Option<String>,
    pub bus_replicas: usize,
    pub room_creation_lock_ttl: Duration,
    pub scheduler_lock_ttl: Duration,
    pub ping_timeout: Duration,
    pub offline_threshold: Duration,
    pub fast_tick_interval: Duration,
    pub slow_tick_interval: Duration,
    pub max_room_duration: Option<Duration>,
    pub zero_participant_grace: Duration,
    pub default_empty_timeout: Duration,
    pub default_max_participants: u32,
    pub cleanup_grace: Duration,
    pub jwt_secret: String,
    pub token_lifetime: Duration,
}

impl CoreConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Tick intervals and lock TTLs must be at least one second.
    ///
    /// | Env Var                       | Default     |
    /// |-------------------------------|-------------|
    /// | `HOST`                        | `0.0.0.0`   |
    /// | `PORT`                        | `3000`      |
    /// | `DATABASE_URL`                | unset       |
    /// | `BUS_REPLICAS`                | `1`         |
    /// | `ROOM_CREATION_LOCK_TTL_SECS` | `30`        |
    /// | `SCHEDULER_LOCK_TTL_SECS`     | `300`       |
    /// | `PING_TIMEOUT_SECS`           | `30`        |
    /// | `OFFLINE_THRESHOLD_SECS`      | `30`        |
    /// | `FAST_TICK_SECS`              | `5`         |
    /// | `SLOW_TICK_SECS`              | `120`       |
    /// | `MAX_ROOM_DURATION_SECS`      | unset (off) |
    /// | `ZERO_PARTICIPANT_GRACE_SECS` | `600`       |
    /// | `DEFAULT_EMPTY_TIMEOUT_SECS`  | `120`       |
    /// | `DEFAULT_MAX_PARTICIPANTS`    | `100`       |
    /// | `CLEANUP_GRACE_SECS`          | `30`        |
    /// | `JWT_SECRET`                  | dev secret  |
    /// | `TOKEN_LIFETIME_SECS`         | `86400`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse_or(&lookup, name, default).map(Duration::from_secs)
        };
        // Tick periods and lease lifetimes
        let positive_secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            let value = secs(name, default)?;
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    value: "0".into(),
                });
            }
            Ok(value)
        };

        let max_room_duration = match lookup("MAX_ROOM_DURATION_SECS") {
            Some(value) => Some(Duration::from_secs(parse_value(
                "MAX_ROOM_DURATION_SECS",
                value,
            )?)),
            None => None,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PORT", 3000)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            bus_replicas: parse_or(&lookup, "BUS_REPLICAS", 1)?,
            room_creation_lock_ttl: positive_secs("ROOM_CREATION_LOCK_TTL_SECS", 30)?,
            scheduler_lock_ttl: positive_secs("SCHEDULER_LOCK_TTL_SECS", 300)?,
            ping_timeout: secs("PING_TIMEOUT_SECS", 30)?,
            offline_threshold: secs("OFFLINE_THRESHOLD_SECS", 30)?,
            fast_tick_interval: positive_secs("FAST_TICK_SECS", 5)?,
            slow_tick_interval: positive_secs("SLOW_TICK_SECS", 120)?,
            max_room_duration,
            zero_participant_grace: secs("ZERO_PARTICIPANT_GRACE_SECS", 600)?,
            default_empty_timeout: secs("DEFAULT_EMPTY_TIMEOUT_SECS", 120)?,
            default_max_participants: parse_or(&lookup, "DEFAULT_MAX_PARTICIPANTS", 100)?,
            cleanup_grace: secs("CLEANUP_GRACE_SECS", 30)?,
            jwt_secret: lookup("JWT_SECRET")
                .unwrap_or_else(|| "dev-secret-change-in-production".into()),
            token_lifetime: secs("TOKEN_LIFETIME_SECS", 86_400)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn room_store_settings(&self) -> RoomStoreSettings {
        RoomStoreSettings {
            replicas: self.bus_replicas,
            creation_lock_ttl: self.room_creation_lock_ttl,
            default_empty_timeout: self.default_empty_timeout,
            default_max_participants: self.default_max_participants,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            fast_interval: self.fast_tick_interval,
            slow_interval: self.slow_tick_interval,
            max_room_duration: self.max_room_duration,
            ping_timeout: self.ping_timeout,
            offline_threshold: self.offline_threshold,
            zero_participant_grace: self.zero_participant_grace,
            task_lock_ttl: self.scheduler_lock_ttl,
            cleanup_grace: self.cleanup_grace,
        }
    }

    pub fn token_config(&self) -> TokenConfig {
        TokenConfig::new(
            self.jwt_secret.clone(),
            chrono::Duration::seconds(self.token_lifetime.as_secs() as i64),
        )
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => parse_value(name, value),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:3000");
        assert_eq!(config.offline_threshold, Duration::from_secs(30));
        assert!(config.database_url.is_none());
        assert!(config.max_room_duration.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = CoreConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("BUS_REPLICAS", "3"),
            ("MAX_ROOM_DURATION_SECS", "3600"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.room_store_settings().replicas, 3);
        assert_eq!(
            config.scheduler_config().max_room_duration,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let result = CoreConfig::from_lookup(lookup(&[("FAST_TICK_SECS", "soon")]));
        assert_eq!(
            result.unwrap_err(),
            ConfigError::Invalid {
                name: "FAST_TICK_SECS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn test_zero_tick_intervals_are_rejected() {
        for name in ["FAST_TICK_SECS", "SLOW_TICK_SECS", "SCHEDULER_LOCK_TTL_SECS"] {
            let result = CoreConfig::from_lookup(lookup(&[(name, "0")]));
            assert_eq!(
                result.unwrap_err(),
                ConfigError::Invalid {
                    name,
                    value: "0".into()
                }
            );
        }
    }
}

use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(90);
pub const DEFAULT_RENEWAL_PERIOD: Duration = Duration::from_secs(40);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MINIMUM_POLL: Duration = Duration::from_secs(5);

/// Timing knobs shared by every lease a [`Coordinator`](crate::Coordinator) takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How long an unrenewed lease survives before others may take it.
    pub lease_duration: Duration,

    /// Delay between renewals of a held lease. Must stay well under `lease_duration`.
    pub renewal_period: Duration,

    /// How long run-once waits between attempts while another caller holds the lease.
    pub poll_interval: Duration,

    /// Floor on the sleep between run-periodically iterations.
    pub minimum_poll: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renewal_period: DEFAULT_RENEWAL_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            minimum_poll: DEFAULT_MINIMUM_POLL,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by any `LEASE_RUNNER_*_SECS` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_secs("LEASE_RUNNER_LEASE_DURATION_SECS")? {
            config.lease_duration = secs;
        }
        if let Some(secs) = env_secs("LEASE_RUNNER_RENEWAL_PERIOD_SECS")? {
            config.renewal_period = secs;
        }
        if let Some(secs) = env_secs("LEASE_RUNNER_POLL_INTERVAL_SECS")? {
            config.poll_interval = secs;
        }
        if let Some(secs) = env_secs("LEASE_RUNNER_MINIMUM_POLL_SECS")? {
            config.minimum_poll = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("lease_duration", self.lease_duration),
            ("renewal_period", self.renewal_period),
            ("poll_interval", self.poll_interval),
            ("minimum_poll", self.minimum_poll),
        ]
        .iter()
        {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.renewal_period >= self.lease_duration {
            return Err(Error::InvalidConfig(format!(
                "renewal_period ({:?}) must be shorter than lease_duration ({:?})",
                self.renewal_period, self.lease_duration
            )));
        }

        Ok(())
    }
}

/// Settings for [`DynamoStore`](crate::store::dynamo::DynamoStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoConfig {
    pub table_name: String,
    pub region: String,

    /// Attempts per request when DynamoDB throttles or fails transiently.
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            table_name: "lease_runner".to_string(),
            region: "us-east-1".to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl DynamoConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(table) = env_string("LEASE_RUNNER_DYNAMO_TABLE") {
            config.table_name = table;
        }
        if let Some(region) = env_string("LEASE_RUNNER_DYNAMO_REGION") {
            config.region = region;
        }

        if config.table_name.is_empty() {
            return Err(Error::InvalidConfig(
                "LEASE_RUNNER_DYNAMO_TABLE must not be empty".to_string(),
            ));
        }
        Ok(config)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match env_string(name) {
        Some(value) => value
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| Error::InvalidConfig(format!("{} ('{}'): {}", name, value, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(90));
        assert_eq!(config.renewal_period, Duration::from_secs(40));
        config.validate().unwrap();
    }

    #[test]
    fn renewal_must_beat_expiry() {
        let config = CoordinatorConfig {
            renewal_period: Duration::from_secs(90),
            ..CoordinatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn zero_poll_is_rejected() {
        let config = CoordinatorConfig {
            minimum_poll: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn env_overrides_and_rejects_garbage() {
        std::env::set_var("LEASE_RUNNER_POLL_INTERVAL_SECS", "2");
        let config = CoordinatorConfig::from_env().unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(2));

        std::env::set_var("LEASE_RUNNER_POLL_INTERVAL_SECS", "soon");
        assert!(matches!(
            CoordinatorConfig::from_env(),
            Err(Error::InvalidConfig(_))
        ));
        std::env::remove_var("LEASE_RUNNER_POLL_INTERVAL_SECS");
    }
}

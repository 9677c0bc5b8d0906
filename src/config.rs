use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::bus::BusSettings;
use crate::consumer::redelivery::RedeliveryPolicy;
use crate::outbox::DispatcherConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Which halves of the platform this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Auction,
    Search,
    All,
}

impl ServiceRole {
    pub fn runs_auction(&self) -> bool {
        matches!(self, ServiceRole::Auction | ServiceRole::All)
    }

    pub fn runs_search(&self) -> bool {
        matches!(self, ServiceRole::Search | ServiceRole::All)
    }
}

impl FromStr for ServiceRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auction" => Ok(ServiceRole::Auction),
            "search" => Ok(ServiceRole::Search),
            "all" => Ok(ServiceRole::All),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: ServiceRole,
    pub host: String,
    pub auction_port: u16,
    pub search_port: u16,
    pub auction_database_url: Option<String>,
    pub search_database_url: Option<String>,
    pub dispatcher: DispatcherConfig,
    pub redelivery: RedeliveryPolicy,
    pub consumer_concurrency: usize,
    pub auction_service_url: String,
    pub catch_up_retry: Duration,
    pub bus: BusSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let role = vars.parse("SERVICE_ROLE", ServiceRole::All)?;
        let auction_database_url = vars.get("AUCTION_DATABASE_URL");
        let search_database_url = vars.get("SEARCH_DATABASE_URL");
        if role.runs_auction() && auction_database_url.is_none() {
            return Err(ConfigError::Missing("AUCTION_DATABASE_URL"));
        }
        if role.runs_search() && search_database_url.is_none() {
            return Err(ConfigError::Missing("SEARCH_DATABASE_URL"));
        }

        let defaults = DispatcherConfig::default();
        let dispatcher = DispatcherConfig {
            poll_interval: vars.secs("OUTBOX_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            batch_size: vars.parse("OUTBOX_BATCH_SIZE", defaults.batch_size)?,
            claim_lease: vars.secs("OUTBOX_CLAIM_LEASE_SECS", defaults.claim_lease)?,
            retention: vars.secs("OUTBOX_RETENTION_SECS", defaults.retention)?,
        };
        if dispatcher.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "OUTBOX_POLL_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        if dispatcher.batch_size < 1 {
            return Err(ConfigError::Invalid {
                var: "OUTBOX_BATCH_SIZE",
                value: dispatcher.batch_size.to_string(),
            });
        }

        let defaults = RedeliveryPolicy::default();
        let redelivery = RedeliveryPolicy {
            retry_limit: vars.parse("CONSUMER_RETRY_LIMIT", defaults.retry_limit)?,
            interval: vars.secs("CONSUMER_RETRY_INTERVAL_SECS", defaults.interval)?,
        };

        let consumer_concurrency: usize = vars.parse("CONSUMER_CONCURRENCY", 8)?;
        if consumer_concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "CONSUMER_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            role,
            host: vars.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            auction_port: vars.parse("AUCTION_PORT", 7001)?,
            search_port: vars.parse("SEARCH_PORT", 7002)?,
            auction_database_url,
            search_database_url,
            dispatcher,
            redelivery,
            consumer_concurrency,
            auction_service_url: vars
                .get("AUCTION_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:7001".to_string()),
            catch_up_retry: vars.secs("CATCH_UP_RETRY_SECS", Duration::from_secs(5))?,
            bus: BusSettings {
                kafka_brokers: vars.get("KAFKA_BROKERS"),
            },
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value }),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }
}

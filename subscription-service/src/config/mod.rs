use chrono::NaiveDate;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SERVICE_NAME: &str = "subscription-service";
pub const DEFAULT_TOPIC: &str = "cancel-subscription";
pub const DEFAULT_ANCHOR_DATE: &str = "2023-11-02";
pub const DEFAULT_PRICE: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub billing: BillingConfig,
    pub notification: NotificationConfig,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Reference Thursday the week counter is derived from.
    pub anchor_date: NaiveDate,
    /// Fee for bundles missing from `bundle_prices`. `None` makes unknown bundles a lookup error.
    pub default_price: Option<u64>,
    pub bundle_prices: HashMap<i64, u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub topic: String,
    pub queue_capacity: usize,
    pub outbox_poll_interval_secs: u64,
    pub publish_timeout_secs: u64,
}

impl NotificationConfig {
    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_poll_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// The queue needs at least one slot and the outbox relay a non-zero period.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.queue_capacity == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "NOTIFICATION_QUEUE_CAPACITY must be at least 1"
            )));
        }
        if self.outbox_poll_interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "NOTIFICATION_OUTBOX_POLL_SECS must be at least 1"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub enabled: bool,
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let anchor_date = parse_anchor_date(&get_env("BILLING_ANCHOR_DATE", Some(DEFAULT_ANCHOR_DATE))?)?;
        let default_price = match env::var("BILLING_DEFAULT_PRICE") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(parse_value("BILLING_DEFAULT_PRICE", &value)?),
            Err(_) => Some(DEFAULT_PRICE),
        };
        let bundle_prices = parse_bundle_prices(&get_env("BILLING_BUNDLE_PRICES", Some(""))?)?;

        let notification = NotificationConfig {
            topic: get_env("BUS_TOPIC", Some(DEFAULT_TOPIC))?,
            queue_capacity: parse_value(
                "NOTIFICATION_QUEUE_CAPACITY",
                &get_env("NOTIFICATION_QUEUE_CAPACITY", Some("1"))?,
            )?,
            outbox_poll_interval_secs: parse_value(
                "NOTIFICATION_OUTBOX_POLL_SECS",
                &get_env("NOTIFICATION_OUTBOX_POLL_SECS", Some("60"))?,
            )?,
            publish_timeout_secs: parse_value(
                "NOTIFICATION_PUBLISH_TIMEOUT_SECS",
                &get_env("NOTIFICATION_PUBLISH_TIMEOUT_SECS", Some("30"))?,
            )?,
        };
        notification.validate()?;

        Ok(SubscriptionConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some(DEFAULT_SERVICE_NAME))?,
            log_level: get_env("LOG_LEVEL", Some("info"))?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None)?,
                max_connections: parse_value(
                    "DATABASE_MAX_CONNECTIONS",
                    &get_env("DATABASE_MAX_CONNECTIONS", Some("10"))?,
                )?,
                min_connections: parse_value(
                    "DATABASE_MIN_CONNECTIONS",
                    &get_env("DATABASE_MIN_CONNECTIONS", Some("2"))?,
                )?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://redis:6379"))?,
            },
            billing: BillingConfig {
                anchor_date,
                default_price,
                bundle_prices,
            },
            notification,
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("smtp.gmail.com"))?,
                port: parse_value("SMTP_PORT", &get_env("SMTP_PORT", Some("587"))?)?,
                user: get_env("SMTP_USER", Some(""))?,
                password: get_env("SMTP_PASSWORD", Some(""))?,
                from_email: get_env("SMTP_FROM_EMAIL", Some("noreply@gophereats.local"))?,
                from_name: get_env("SMTP_FROM_NAME", Some("GopherEats"))?,
                enabled: env::var("SMTP_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => match default {
            Some(def) => Ok(def.to_string()),
            None => Err(AppError::ConfigError(anyhow::anyhow!(
                "{} is required but not set",
                key
            ))),
        },
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} has invalid value {:?}: {}", key, raw, e))
    })
}

/// Parse a `YYYY-MM-DD` anchor date.
pub fn parse_anchor_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "BILLING_ANCHOR_DATE {:?} is not a YYYY-MM-DD date: {}",
            raw,
            e
        ))
    })
}

/// Parse `bundle_id=price` pairs separated by commas, e.g. `1=500,2=750`.
pub fn parse_bundle_prices(raw: &str) -> Result<HashMap<i64, u64>, AppError> {
    let mut prices = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (bundle, price) = pair.split_once('=').ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "BILLING_BUNDLE_PRICES entry {:?} is not bundle_id=price",
                pair
            ))
        })?;
        let bundle_id: i64 = parse_value("BILLING_BUNDLE_PRICES", bundle)?;
        let price: u64 = parse_value("BILLING_BUNDLE_PRICES", price)?;
        prices.insert(bundle_id, price);
    }
    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_prices_parse_pairs() {
        let prices = parse_bundle_prices(" 1=500, 2=750 ,").unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&1], 500);
        assert_eq!(prices[&2], 750);
    }

    #[test]
    fn empty_bundle_prices_are_allowed() {
        assert!(parse_bundle_prices("").unwrap().is_empty());
    }

    #[test]
    fn malformed_bundle_prices_are_rejected() {
        assert!(parse_bundle_prices("1:500").is_err());
        assert!(parse_bundle_prices("one=500").is_err());
        assert!(parse_bundle_prices("1=-5").is_err());
    }

    #[test]
    fn anchor_date_parses_iso_dates() {
        let anchor = parse_anchor_date(DEFAULT_ANCHOR_DATE).unwrap();
        assert_eq!(anchor, NaiveDate::from_ymd_opt(2023, 11, 2).unwrap());
        assert!(parse_anchor_date("02/11/2023").is_err());
    }

    #[test]
    fn notification_durations_use_seconds() {
        let config = NotificationConfig {
            topic: DEFAULT_TOPIC.to_string(),
            queue_capacity: 1,
            outbox_poll_interval_secs: 60,
            publish_timeout_secs: 30,
        };
        assert_eq!(config.outbox_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.publish_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_notification_settings_are_rejected() {
        let valid = NotificationConfig {
            topic: DEFAULT_TOPIC.to_string(),
            queue_capacity: 1,
            outbox_poll_interval_secs: 60,
            publish_timeout_secs: 0,
        };
        assert!(valid.validate().is_ok());

        let no_relay_period = NotificationConfig {
            outbox_poll_interval_secs: 0,
            ..valid.clone()
        };
        assert!(matches!(
            no_relay_period.validate(),
            Err(AppError::ConfigError(_))
        ));

        let no_queue = NotificationConfig {
            queue_capacity: 0,
            ..valid
        };
        assert!(matches!(no_queue.validate(), Err(AppError::ConfigError(_))));
    }
}

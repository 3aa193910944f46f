//! Environment configuration.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    pub port: u16,
    pub checkout: CheckoutConfig,
    pub sweep_interval: Duration,
}

/// Knobs the checkout core reads.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckoutConfig {
    pub hold_window: chrono::Duration,
    pub free_shipping_threshold: Decimal,
    pub shipping_charge: Decimal,
    pub currency: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            hold_window: chrono::Duration::seconds(180),
            free_shipping_threshold: Decimal::new(499, 0),
            shipping_charge: Decimal::new(50, 0),
            currency: "INR".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    /// Reads the process environment; call `dotenvy::dotenv()` first to pick up a `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = CheckoutConfig::default();
        let hold_secs: i64 = parse(&lookup, "HOLD_WINDOW_SECS", 180)?;
        if hold_secs <= 0 {
            return Err(ConfigError::Invalid { name: "HOLD_WINDOW_SECS", value: hold_secs.to_string() });
        }
        let sweep_secs: u64 = parse(&lookup, "HOLD_SWEEP_INTERVAL_SECS", 30)?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid { name: "HOLD_SWEEP_INTERVAL_SECS", value: sweep_secs.to_string() });
        }
        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            nats_url: lookup("NATS_URL").filter(|url| !url.is_empty()),
            port: parse(&lookup, "PORT", 8083)?,
            sweep_interval: Duration::from_secs(sweep_secs),
            checkout: CheckoutConfig {
                hold_window: chrono::Duration::seconds(hold_secs),
                free_shipping_threshold: parse(&lookup, "FREE_SHIPPING_THRESHOLD", defaults.free_shipping_threshold)?,
                shipping_charge: parse(&lookup, "SHIPPING_CHARGE", defaults.shipping_charge)?,
                currency: lookup("CURRENCY").unwrap_or(defaults.currency),
            },
        })
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8083);
        assert_eq!(config.checkout, CheckoutConfig::default());
        assert!(config.nats_url.is_none());
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[("HOLD_WINDOW_SECS", "60"), ("SHIPPING_CHARGE", "39.50"), ("NATS_URL", "")])).unwrap();
        assert_eq!(config.checkout.hold_window, chrono::Duration::seconds(60));
        assert_eq!(config.checkout.shipping_charge, Decimal::new(3950, 2));
        assert!(config.nats_url.is_none());
    }

    #[test]
    fn test_bad_value_names_variable() {
        let err = Config::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert!(Config::from_lookup(lookup(&[("HOLD_WINDOW_SECS", "0")])).is_err());
        let err = Config::from_lookup(lookup(&[("HOLD_SWEEP_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("HOLD_SWEEP_INTERVAL_SECS"));
        assert!(Config::from_lookup(lookup(&[("HOLD_SWEEP_INTERVAL_SECS", "-5")])).is_err());
    }
}

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub webhook_secret: String,
    pub billing_secret: String,
    pub admin_secret: String,
    pub billing_interval_ms: i64,
    pub billing_autorun: bool,
    pub platform_fee_bps: i64,
    pub call_cooldown_ms: i64,
    pub call_cooldown_capacity: usize,
    pub withdrawal_ttl_ms: i64,
    pub notify_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        let database_path = require(&env_map, "DATABASE_PATH")?;
        let webhook_secret = require(&env_map, "WEBHOOK_SECRET")?;
        let billing_secret = require(&env_map, "BILLING_SECRET")?;
        let admin_secret = require(&env_map, "ADMIN_SECRET")?;

        let billing_interval_ms =
            parse_positive_secs(&env_map, "BILLING_INTERVAL_SECS", 60)? * 1_000;

        let billing_autorun = match env_map
            .get("BILLING_AUTORUN")
            .map(|s| s.as_str())
            .unwrap_or("true")
        {
            "true" => true,
            "false" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "BILLING_AUTORUN".to_string(),
                    format!("must be true or false, got {}", other),
                ))
            }
        };

        let platform_fee_bps = env_map
            .get("PLATFORM_FEE_BPS")
            .map(|s| s.as_str())
            .unwrap_or("2000")
            .parse::<i64>()
            .ok()
            .filter(|v| (0..=10_000).contains(v))
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "PLATFORM_FEE_BPS".to_string(),
                    "must be an integer between 0 and 10000".to_string(),
                )
            })?;

        let call_cooldown_ms = parse_positive_secs(&env_map, "CALL_COOLDOWN_SECS", 30)? * 1_000;

        let call_cooldown_capacity = env_map
            .get("CALL_COOLDOWN_CAPACITY")
            .map(|s| s.as_str())
            .unwrap_or("4096")
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "CALL_COOLDOWN_CAPACITY".to_string(),
                    "must be a positive integer".to_string(),
                )
            })?;

        let withdrawal_ttl_ms =
            parse_positive_secs(&env_map, "WITHDRAWAL_TTL_SECS", 7 * 24 * 3_600)? * 1_000;

        let notify_url = env_map.get("NOTIFY_URL").cloned().filter(|s| !s.is_empty());

        Ok(Config {
            port,
            database_path,
            webhook_secret,
            billing_secret,
            admin_secret,
            billing_interval_ms,
            billing_autorun,
            platform_fee_bps,
            call_cooldown_ms,
            call_cooldown_capacity,
            withdrawal_ttl_ms,
            notify_url,
        })
    }
}

fn require(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .cloned()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_positive_secs(
    env_map: &HashMap<String, String>,
    key: &str,
    default_secs: i64,
) -> Result<i64, ConfigError> {
    env_map
        .get(key)
        .map(|s| {
            s.parse::<i64>().ok().filter(|v| *v > 0).ok_or_else(|| {
                ConfigError::InvalidValue(
                    key.to_string(),
                    "must be a positive integer of seconds".to_string(),
                )
            })
        })
        .unwrap_or(Ok(default_secs))
}

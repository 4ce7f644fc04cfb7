use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Process configuration, read once at boot and handed to `AppState`.
#[derive(Clone, Debug)]
pub struct Config {
    /// Postgres connection string; without one the in-memory store is used.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    /// Generic extraction endpoint; takes precedence over OpenAI when set.
    pub extraction_url: Option<String>,
    pub extraction_timeout: Duration,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    /// Number the inbound call is dialled through to.
    pub forward_number: String,
    /// Host used in TwiML callback urls instead of the request `Host` header.
    pub public_host: Option<String>,
    pub recording_cache_dir: PathBuf,
    pub call_retention_days: i64,
    pub recording_cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            port: 8000,
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            extraction_url: None,
            extraction_timeout: Duration::from_secs(10),
            twilio_account_sid: None,
            twilio_auth_token: None,
            forward_number: "+447366432353".to_string(),
            public_host: None,
            recording_cache_dir: PathBuf::from("recordings"),
            call_retention_days: 90,
            recording_cache_ttl: Duration::from_secs(2 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            log_level: LevelFilter::DEBUG,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let mut database_url = get("DATABASE_URL");
        // Hosting platforms still hand out the legacy scheme.
        if let Some(url) = database_url.as_mut() {
            if let Some(rest) = url.strip_prefix("postgres://") {
                *url = format!("postgresql://{rest}");
            }
        }

        Ok(Self {
            database_url,
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            port: parse_or(&get, "PORT", defaults.port)?,
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            extraction_url: get("EXTRACTION_URL"),
            extraction_timeout: positive_secs(
                &get,
                "EXTRACTION_TIMEOUT_SECS",
                defaults.extraction_timeout,
            )?,
            twilio_account_sid: get("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: get("TWILIO_AUTH_TOKEN"),
            forward_number: get("FORWARD_NUMBER").unwrap_or(defaults.forward_number),
            public_host: get("PUBLIC_HOST"),
            recording_cache_dir: get("RECORDING_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.recording_cache_dir),
            call_retention_days: retention_days(&get, defaults.call_retention_days)?,
            recording_cache_ttl: positive_secs(
                &get,
                "RECORDING_CACHE_TTL_SECS",
                defaults.recording_cache_ttl,
            )?,
            sweep_interval: positive_secs(&get, "SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            log_level: parse_or(&get, "LOG_LEVEL", defaults.log_level)?,
        })
    }

    /// Basic-auth credentials for fetching recordings from Twilio.
    pub fn twilio_credentials(&self) -> Option<(&str, &str)> {
        match (&self.twilio_account_sid, &self.twilio_auth_token) {
            (Some(sid), Some(token)) => Some((sid.as_str(), token.as_str())),
            _ => None,
        }
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn positive_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match parse_or(get, key, default.as_secs())? {
        0 => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

const MAX_RETENTION_DAYS: i64 = 100 * 366;

fn retention_days(
    get: &impl Fn(&str) -> Option<String>,
    default: i64,
) -> Result<i64, ConfigError> {
    let key = "CALL_RETENTION_DAYS";
    match parse_or(get, key, default)? {
        days @ 1..=MAX_RETENTION_DAYS => Ok(days),
        days => Err(ConfigError::Invalid {
            key,
            value: days.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config_from(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.port, 8000);
        assert_eq!(config.call_retention_days, 90);
        assert_eq!(config.recording_cache_ttl, Duration::from_secs(7200));
        assert_eq!(config.extraction_timeout, Duration::from_secs(10));
    }

    #[test]
    fn legacy_postgres_scheme_is_rewritten() {
        let config = config_from(&[("DATABASE_URL", "postgres://u:p@db/calls")]).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgresql://u:p@db/calls")
        );
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(config_from(&[("SWEEP_INTERVAL_SECS", "0")]).is_err());
        assert!(config_from(&[("EXTRACTION_TIMEOUT_SECS", "0")]).is_err());
        let config = config_from(&[("SWEEP_INTERVAL_SECS", "60")]).unwrap();
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn retention_must_be_positive_and_bounded() {
        for bad in ["0", "-1", "1000000000000000"] {
            let err = config_from(&[("CALL_RETENTION_DAYS", bad)]).unwrap_err();
            assert!(err.to_string().contains("CALL_RETENTION_DAYS"), "{bad}");
        }
        assert!(config_from(&[("RECORDING_CACHE_TTL_SECS", "0")]).is_err());
        let config = config_from(&[("CALL_RETENTION_DAYS", "30")]).unwrap();
        assert_eq!(config.call_retention_days, 30);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("OPENAI_API_KEY", "  "), ("LOG_LEVEL", "warn")]).unwrap();
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.log_level, LevelFilter::WARN);
    }

    #[test]
    fn credentials_need_both_halves() {
        let config = config_from(&[("TWILIO_ACCOUNT_SID", "AC123")]).unwrap();
        assert!(config.twilio_credentials().is_none());
        let config = config_from(&[("TWILIO_ACCOUNT_SID", "AC123"), ("TWILIO_AUTH_TOKEN", "t")])
            .unwrap();
        assert_eq!(config.twilio_credentials(), Some(("AC123", "t")));
    }
}

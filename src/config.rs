use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub dispatch: DispatchConfig,
    pub geo_cell_degrees: f64,
    pub offer_queue_size: usize,
    pub event_buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub fanout_size: usize,
    pub offer_timeout: Duration,
    pub max_fanout_rounds: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fanout_size: 3,
            offer_timeout: Duration::from_secs(15),
            max_fanout_rounds: 3,
        }
    }
}

pub const DEFAULT_GEO_CELL_DEGREES: f64 = 0.05;

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact/json"
                )));
            }
        };

        let dispatch = DispatchConfig {
            fanout_size: parse_or_default("DISPATCH_FANOUT_SIZE", 3)?,
            offer_timeout: Duration::from_millis(parse_or_default(
                "DISPATCH_OFFER_TIMEOUT_MS",
                15_000u64,
            )?),
            max_fanout_rounds: parse_or_default("DISPATCH_MAX_FANOUT_ROUNDS", 3)?,
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            dispatch,
            geo_cell_degrees: parse_or_default("GEO_CELL_DEGREES", DEFAULT_GEO_CELL_DEGREES)?,
            offer_queue_size: parse_or_default("OFFER_QUEUE_SIZE", 1024)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.dispatch.fanout_size == 0 {
            return Err(AppError::Internal(
                "DISPATCH_FANOUT_SIZE must be > 0".to_string(),
            ));
        }
        if self.dispatch.max_fanout_rounds == 0 {
            return Err(AppError::Internal(
                "DISPATCH_MAX_FANOUT_ROUNDS must be > 0".to_string(),
            ));
        }
        if !(self.geo_cell_degrees > 0.0 && self.geo_cell_degrees <= 10.0) {
            return Err(AppError::Internal(format!(
                "GEO_CELL_DEGREES must be in (0, 10], got {}",
                self.geo_cell_degrees
            )));
        }
        if self.offer_queue_size == 0 || self.event_buffer_size == 0 {
            return Err(AppError::Internal(
                "queue and buffer sizes must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            dispatch: DispatchConfig::default(),
            geo_cell_degrees: DEFAULT_GEO_CELL_DEGREES,
            offer_queue_size: 1024,
            event_buffer_size: 1024,
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

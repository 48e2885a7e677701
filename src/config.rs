use crate::device_client::DeviceGeneration;
use crate::status_mapper::Phase;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DEVICE_INSTANCE: u32 = 40;
const DEFAULT_POLL_INTERVAL_MS: u64 = 750;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 500;
const DEFAULT_DEGRADED_THRESHOLD: u32 = 3;
const DEFAULT_MODBUS_LISTEN: &str = "0.0.0.0:5502";
const MAX_DEVICE_INSTANCE: u32 = 255;
const MAX_SIGN_OF_LIFE_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Immutable bridge configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub generation: DeviceGeneration,
    pub channel: u8,
    pub device_instance: u32,
    pub custom_name: String,
    pub phase: Phase,
    pub position: u8,
    pub invert_power: bool,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub degraded_threshold: u32,
    /// `None` disables the sign-of-life report.
    pub sign_of_life: Option<Duration>,
    pub modbus_listen: SocketAddr,
}

impl BridgeConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = get("SHELLY_HOST").ok_or(ConfigError::Missing("SHELLY_HOST"))?;
        // the HTTP client is built without a TLS backend
        if let Some((scheme, _)) = host.trim().split_once("://") {
            if !scheme.eq_ignore_ascii_case("http") {
                return Err(ConfigError::Invalid {
                    key: "SHELLY_HOST",
                    value: host.clone(),
                    reason: format!("unsupported scheme '{scheme}', only http:// is supported"),
                });
            }
        }
        let generation = if parse_bool_safe(get("SHELLY_PLUS")) {
            DeviceGeneration::Plus
        } else {
            DeviceGeneration::Gen1
        };

        let phase = match get("PHASE") {
            Some(label) => label.parse::<Phase>().map_err(|e| ConfigError::Invalid {
                key: "PHASE",
                value: label.clone(),
                reason: e.to_string(),
            })?,
            None => Phase::L1,
        };

        let position: u8 = parse_number(&get, "POSITION", 0)?;
        if position > 2 {
            return Err(ConfigError::Invalid {
                key: "POSITION",
                value: position.to_string(),
                reason: "must be 0, 1 or 2".to_string(),
            });
        }

        let poll_interval = Duration::from_millis(parse_number(
            &get,
            "POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        let request_timeout = Duration::from_millis(parse_number(
            &get,
            "REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_MS",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if request_timeout.is_zero() || request_timeout >= poll_interval {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_MS",
                value: request_timeout.as_millis().to_string(),
                reason: format!(
                    "must be non-zero and shorter than the poll interval ({}ms)",
                    poll_interval.as_millis()
                ),
            });
        }

        let degraded_threshold: u32 =
            parse_number(&get, "DEGRADED_THRESHOLD", DEFAULT_DEGRADED_THRESHOLD)?;
        if degraded_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "DEGRADED_THRESHOLD",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let sign_of_life_minutes: u64 = parse_number(&get, "SIGN_OF_LIFE_MINUTES", 0)?;
        if sign_of_life_minutes > MAX_SIGN_OF_LIFE_MINUTES {
            return Err(ConfigError::Invalid {
                key: "SIGN_OF_LIFE_MINUTES",
                value: sign_of_life_minutes.to_string(),
                reason: format!("must be at most {MAX_SIGN_OF_LIFE_MINUTES}"),
            });
        }
        let sign_of_life =
            (sign_of_life_minutes > 0).then(|| Duration::from_secs(sign_of_life_minutes * 60));

        let device_instance: u32 =
            parse_number(&get, "DEVICE_INSTANCE", DEFAULT_DEVICE_INSTANCE)?;
        if device_instance > MAX_DEVICE_INSTANCE {
            return Err(ConfigError::Invalid {
                key: "DEVICE_INSTANCE",
                value: device_instance.to_string(),
                reason: format!("must be at most {MAX_DEVICE_INSTANCE}"),
            });
        }

        let listen = get("MODBUS_LISTEN").unwrap_or_else(|| DEFAULT_MODBUS_LISTEN.to_string());
        let modbus_listen = listen.parse().map_err(|e| ConfigError::Invalid {
            key: "MODBUS_LISTEN",
            value: listen.clone(),
            reason: format!("{e}"),
        })?;

        Ok(Self {
            host,
            username: lookup("SHELLY_USERNAME").unwrap_or_default(),
            password: lookup("SHELLY_PASSWORD").unwrap_or_default(),
            generation,
            channel: parse_number(&get, "SHELLY_CHANNEL", 0)?,
            device_instance,
            custom_name: get("CUSTOM_NAME")
                .unwrap_or_else(|| generation.product_name().to_string()),
            phase,
            position,
            invert_power: parse_bool_safe(get("INVERT_POWER")),
            poll_interval,
            request_timeout,
            degraded_threshold,
            sign_of_life,
            modbus_listen,
        })
    }

    /// Bus service name, e.g. `com.victronenergy.pvinverter.http_40`.
    pub fn service_name(&self) -> String {
        format!(
            "com.victronenergy.pvinverter.http_{:02}",
            self.device_instance
        )
    }
}

fn parse_number<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    matches!(
        val.unwrap_or_default().trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

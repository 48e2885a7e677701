use crate::config::BridgeConfig;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

// Endpoints are documented here
// https://shelly-api-docs.shelly.cloud/gen1/#shelly1-shelly1pm
// https://shelly-api-docs.shelly.cloud/gen2/ComponentsAndServices/Shelly#shellygetstatus

/// Gen1 devices report their energy counter in Watt-minutes.
const WATT_MINUTES_PER_WATT_HOUR: f64 = 60.0;

/// Which Shelly API family the configured device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceGeneration {
    Gen1,
    Plus,
}

impl DeviceGeneration {
    pub fn product_name(&self) -> &'static str {
        match self {
            DeviceGeneration::Gen1 => "Shelly 1PM",
            DeviceGeneration::Plus => "Shelly Plus 1PM",
        }
    }

    pub fn connection_description(&self) -> &'static str {
        match self {
            DeviceGeneration::Gen1 => "Shelly 1PM HTTP JSON service",
            DeviceGeneration::Plus => "Shelly Plus 1PM HTTP JSON service",
        }
    }

    fn status_path(&self) -> &'static str {
        match self {
            DeviceGeneration::Gen1 => "status",
            DeviceGeneration::Plus => "rpc/Shelly.GetStatus",
        }
    }
}

/// One decoded status response. Energy is always normalised to Watt-hours.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub power: f64,
    pub energy_wh: f64,
    pub output_on: bool,
    pub hardware_id: String,
    pub uptime_secs: u64,
    /// Only reported by Plus devices.
    pub voltage: Option<f64>,
    pub current: Option<f64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device rejected the credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("response does not match the device schema: {0}")]
    Schema(String),
}

impl FetchError {
    /// Failures that will not go away without a configuration change.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            FetchError::Unauthorized(_) | FetchError::Schema(_) | FetchError::HttpStatus(404)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            FetchError::Unreachable(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// Anything the poll loop can read a [`DeviceStatus`] from.
pub trait StatusSource {
    fn fetch_status(&self) -> impl Future<Output = Result<DeviceStatus, FetchError>>;
}

pub struct ShellyClient {
    status_url: String,
    username: String,
    password: String,
    generation: DeviceGeneration,
    channel: u8,
    client: reqwest::Client,
}

impl ShellyClient {
    pub fn new(config: &BridgeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            status_url: format!(
                "{}{}",
                base_url(&config.host),
                config.generation.status_path()
            ),
            username: config.username.clone(),
            password: config.password.clone(),
            generation: config.generation,
            channel: config.channel,
            client,
        })
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    pub async fn read_status(&self) -> Result<DeviceStatus, FetchError> {
        let mut request = self.client.get(&self.status_url);
        if !self.username.is_empty() || !self.password.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        decode_status(self.generation, self.channel, &body)
    }
}

impl StatusSource for ShellyClient {
    fn fetch_status(&self) -> impl Future<Output = Result<DeviceStatus, FetchError>> {
        self.read_status()
    }
}

/// `host` has no scheme or `http://` in any case; configuration rejects others.
fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    let authority = host.split_once("://").map_or(host, |(_, rest)| rest);
    format!("http://{authority}/")
}

#[derive(Debug, Deserialize)]
struct Gen1Status {
    mac: String,
    uptime: u64,
    relays: Vec<Gen1Relay>,
    meters: Vec<Gen1Meter>,
}

#[derive(Debug, Deserialize)]
struct Gen1Relay {
    ison: bool,
}

#[derive(Debug, Deserialize)]
struct Gen1Meter {
    power: f64,
    total: f64,
}

#[derive(Debug, Deserialize)]
struct PlusSys {
    mac: String,
    uptime: u64,
}

#[derive(Debug, Deserialize)]
struct PlusSwitch {
    output: bool,
    apower: f64,
    voltage: f64,
    current: f64,
    aenergy: PlusEnergy,
}

#[derive(Debug, Deserialize)]
struct PlusEnergy {
    total: f64,
}

/// Strictly decodes a response body; never yields a partially filled status.
pub fn decode_status(
    generation: DeviceGeneration,
    channel: u8,
    body: &[u8],
) -> Result<DeviceStatus, FetchError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| FetchError::InvalidJson(e.to_string()))?;

    let status = match generation {
        DeviceGeneration::Gen1 => decode_gen1(value, channel)?,
        DeviceGeneration::Plus => decode_plus(value, channel)?,
    };

    if status.hardware_id.trim().is_empty() {
        return Err(FetchError::Schema("empty hardware identifier".to_string()));
    }
    Ok(status)
}

fn decode_gen1(value: Value, channel: u8) -> Result<DeviceStatus, FetchError> {
    let status: Gen1Status =
        serde_json::from_value(value).map_err(|e| FetchError::Schema(e.to_string()))?;
    let index = channel as usize;
    let relay = status
        .relays
        .get(index)
        .ok_or_else(|| FetchError::Schema(format!("no relay at index {channel}")))?;
    let meter = status
        .meters
        .get(index)
        .ok_or_else(|| FetchError::Schema(format!("no meter at index {channel}")))?;

    Ok(DeviceStatus {
        power: meter.power,
        energy_wh: meter.total / WATT_MINUTES_PER_WATT_HOUR,
        output_on: relay.ison,
        hardware_id: status.mac,
        uptime_secs: status.uptime,
        voltage: None,
        current: None,
    })
}

fn decode_plus(mut value: Value, channel: u8) -> Result<DeviceStatus, FetchError> {
    let sys: PlusSys = take_field(&mut value, "sys")?;
    let switch: PlusSwitch = take_field(&mut value, &format!("switch:{channel}"))?;

    Ok(DeviceStatus {
        power: switch.apower,
        energy_wh: switch.aenergy.total,
        output_on: switch.output,
        hardware_id: sys.mac,
        uptime_secs: sys.uptime,
        voltage: Some(switch.voltage),
        current: Some(switch.current),
    })
}

fn take_field<T: DeserializeOwned>(value: &mut Value, key: &str) -> Result<T, FetchError> {
    let field = value
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| FetchError::Schema(format!("missing field `{key}`")))?;
    serde_json::from_value(field).map_err(|e| FetchError::Schema(format!("{key}: {e}")))
}

#[cfg(test)]
mod test_shelly_client {
    use super::*;
    use mockito::Matcher;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    const GEN1_BODY: &str = r#"
        {
            "wifi_sta": {"connected": true, "ssid": "home", "ip": "192.168.1.20"},
            "relays": [{"ison": true, "has_timer": false, "source": "http"}],
            "meters": [{"power": 1200.5, "overpower": 0.0, "is_valid": true, "total": 2700000}],
            "mac": "A4CF12F45A3B",
            "uptime": 3600
        }
    "#;

    const PLUS_BODY: &str = r#"
        {
            "sys": {"mac": "AABBCC", "uptime": 42, "restart_required": false},
            "switch:0": {
                "id": 0,
                "source": "init",
                "output": false,
                "apower": 1200.0,
                "voltage": 231.4,
                "current": 5.2,
                "aenergy": {"total": 45000.0, "by_minute": [0.0, 0.0, 0.0]},
                "temperature": {"tC": 41.2}
            }
        }
    "#;

    fn config_for(host: &str, pairs: &[(&str, &str)]) -> BridgeConfig {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert("SHELLY_HOST".to_string(), host.to_string());
        map.entry("REQUEST_TIMEOUT_MS".to_string())
            .or_insert_with(|| "200".to_string());
        BridgeConfig::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("192.168.1.20"), "http://192.168.1.20/");
        assert_eq!(base_url("shelly.local:8080/"), "http://shelly.local:8080/");
        assert_eq!(base_url("http://127.0.0.1:1234"), "http://127.0.0.1:1234/");
        assert_eq!(base_url("HTTP://shelly.local"), "http://shelly.local/");
    }

    #[tokio::test]
    async fn test_gen1_status_with_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/status")
            .match_header("Authorization", "Basic YWRtaW46c2VjcmV0")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(GEN1_BODY)
            .create_async()
            .await;

        let config = config_for(
            &server.url(),
            &[("SHELLY_USERNAME", "admin"), ("SHELLY_PASSWORD", "secret")],
        );
        let client = ShellyClient::new(&config).unwrap();
        let status = client.read_status().await.unwrap();

        assert_eq!(status.power, 1200.5);
        assert_eq!(status.energy_wh, 45000.0);
        assert!(status.output_on);
        assert_eq!(status.hardware_id, "A4CF12F45A3B");
        assert_eq!(status.uptime_secs, 3600);
        assert_eq!(status.voltage, None);
        assert_eq!(status.current, None);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_plus_status_without_credentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rpc/Shelly.GetStatus")
            .match_header("Authorization", Matcher::Missing)
            .with_status(200)
            .with_body(PLUS_BODY)
            .create_async()
            .await;

        let config = config_for(&server.url(), &[("SHELLY_PLUS", "true")]);
        let client = ShellyClient::new(&config).unwrap();
        assert!(client.status_url().ends_with("/rpc/Shelly.GetStatus"));

        let status = client.read_status().await.unwrap();
        assert_eq!(status.power, 1200.0);
        assert_eq!(status.energy_wh, 45000.0);
        assert!(!status.output_on);
        assert_eq!(status.hardware_id, "AABBCC");
        assert_eq!(status.voltage, Some(231.4));
        assert_eq!(status.current, Some(5.2));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(401)
            .create_async()
            .await;

        let client = ShellyClient::new(&config_for(&server.url(), &[])).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert_eq!(err, FetchError::Unauthorized(401));
        assert!(err.is_persistent());
    }

    #[tokio::test]
    async fn test_forbidden_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rpc/Shelly.GetStatus")
            .with_status(403)
            .create_async()
            .await;

        let config = config_for(&server.url(), &[("SHELLY_PLUS", "true")]);
        let client = ShellyClient::new(&config).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert_eq!(err, FetchError::Unauthorized(403));
        assert!(err.is_persistent());
    }

    #[tokio::test]
    async fn test_not_found_is_persistent() {
        // a Plus device polled with the Gen1 path answers 404
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(404)
            .create_async()
            .await;

        let client = ShellyClient::new(&config_for(&server.url(), &[])).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert_eq!(err, FetchError::HttpStatus(404));
        assert!(err.is_persistent());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(503)
            .create_async()
            .await;

        let client = ShellyClient::new(&config_for(&server.url(), &[])).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert_eq!(err, FetchError::HttpStatus(503));
        assert!(!err.is_persistent());
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let client = ShellyClient::new(&config_for(&server.url(), &[])).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert!(matches!(err, FetchError::InvalidJson(_)), "got {err:?}");
        assert!(!err.is_persistent());
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ShellyClient::new(&config_for(&addr.to_string(), &[])).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert!(matches!(err, FetchError::Unreachable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ShellyClient::new(&config_for(&addr.to_string(), &[])).unwrap();
        let err = client.read_status().await.unwrap_err();

        assert_eq!(err, FetchError::Timeout);
    }

    #[test]
    fn test_missing_field_is_schema_error() {
        let body = br#"{"mac": "AABBCC", "uptime": 1, "relays": [{"ison": true}], "meters": [{"power": 5.0}]}"#;
        let err = decode_status(DeviceGeneration::Gen1, 0, body).unwrap_err();
        match err {
            FetchError::Schema(reason) => assert!(reason.contains("total"), "{reason}"),
            other => panic!("Expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_generation_is_schema_error() {
        let err = decode_status(DeviceGeneration::Plus, 0, GEN1_BODY.as_bytes()).unwrap_err();
        assert_eq!(err, FetchError::Schema("missing field `sys`".to_string()));
        assert!(err.is_persistent());

        let err = decode_status(DeviceGeneration::Gen1, 0, PLUS_BODY.as_bytes()).unwrap_err();
        assert!(matches!(err, FetchError::Schema(_)));
    }

    #[test]
    fn test_missing_channel() {
        let err = decode_status(DeviceGeneration::Gen1, 1, GEN1_BODY.as_bytes()).unwrap_err();
        assert_eq!(err, FetchError::Schema("no relay at index 1".to_string()));

        let err = decode_status(DeviceGeneration::Plus, 2, PLUS_BODY.as_bytes()).unwrap_err();
        assert_eq!(
            err,
            FetchError::Schema("missing field `switch:2`".to_string())
        );
    }

    #[test]
    fn test_empty_hardware_id() {
        let body = br#"{"mac": " ", "uptime": 1, "relays": [{"ison": true}], "meters": [{"power": 5.0, "total": 60}]}"#;
        let err = decode_status(DeviceGeneration::Gen1, 0, body).unwrap_err();
        assert_eq!(
            err,
            FetchError::Schema("empty hardware identifier".to_string())
        );
    }

    #[test]
    fn test_truncated_body_is_invalid_json() {
        let err = decode_status(DeviceGeneration::Plus, 0, br#"{"sys": {"mac": "#).unwrap_err();
        assert!(matches!(err, FetchError::InvalidJson(_)));
    }
}

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const DEFAULT_API_HOST: &str = "https://api.mixpanel.com";

/// Downstream metrics service. Calls are best-effort: callers log failures
/// and carry on, so telemetry can never destabilize the host application.
pub trait MetricsSink: Send + Sync {
    fn track(&self, event_name: &str, properties: &Map<String, Value>) -> Result<()>;
    fn increment(&self, distinct_id: &str, property: &str, by: f64) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixpanelConfig {
    pub token: String,
    pub api_host: String,
}

impl MixpanelConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_host: DEFAULT_API_HOST.to_string(),
        }
    }

    pub fn with_api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }
}

/// Fire-and-forget client for the Mixpanel HTTP ingestion API.
///
/// Requests are spawned on the provided runtime handle and never awaited by
/// the caller; failures are logged and dropped.
pub struct MixpanelSink {
    config: MixpanelConfig,
    http: reqwest::Client,
    runtime: tokio::runtime::Handle,
}

impl MixpanelSink {
    pub fn new(config: MixpanelConfig, runtime: tokio::runtime::Handle) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            runtime,
        }
    }

    fn post(&self, endpoint: &str, payload: Value) {
        let url = format!("{}/{endpoint}", self.config.api_host);
        let body = encode_form_body(&payload);
        let http = self.http.clone();
        self.runtime.spawn(async move {
            let result = http
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body)
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    log::warn!("Metrics sink returned {} for {url}", response.status());
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Metrics sink request to {url} failed: {e}");
                }
            }
        });
    }
}

impl MetricsSink for MixpanelSink {
    fn track(&self, event_name: &str, properties: &Map<String, Value>) -> Result<()> {
        self.post(
            "track",
            track_payload(&self.config.token, event_name, properties),
        );
        Ok(())
    }

    fn increment(&self, distinct_id: &str, property: &str, by: f64) -> Result<()> {
        self.post(
            "engage",
            increment_payload(&self.config.token, distinct_id, property, by),
        );
        Ok(())
    }
}

/// The ingestion API takes base64-encoded JSON as a `data` form field.
fn encode_form_body(payload: &Value) -> String {
    let encoded = BASE64.encode(payload.to_string());
    format!("data={}", urlencoding::encode(&encoded))
}

fn track_payload(token: &str, event_name: &str, properties: &Map<String, Value>) -> Value {
    let mut properties = properties.clone();
    properties.insert("token".to_string(), Value::String(token.to_string()));
    json!({
        "event": event_name,
        "properties": properties,
    })
}

fn increment_payload(token: &str, distinct_id: &str, property: &str, by: f64) -> Value {
    let mut add = Map::new();
    add.insert(property.to_string(), Value::from(by));
    json!({
        "$token": token,
        "$distinct_id": distinct_id,
        "$add": add,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_payload_adds_token_and_keeps_caller_properties() {
        let mut properties = Map::new();
        properties.insert("distinct_id".to_string(), json!("abc"));
        properties.insert("platform".to_string(), json!("linux"));

        let payload = track_payload("tok-123", "app-launched", &properties);

        assert_eq!(payload["event"], "app-launched");
        assert_eq!(payload["properties"]["token"], "tok-123");
        assert_eq!(payload["properties"]["distinct_id"], "abc");
        assert_eq!(payload["properties"]["platform"], "linux");
    }

    #[test]
    fn test_increment_payload_shape() {
        let payload = increment_payload("tok-123", "user-1", "sessions", 2.0);

        assert_eq!(payload["$token"], "tok-123");
        assert_eq!(payload["$distinct_id"], "user-1");
        assert_eq!(payload["$add"]["sessions"], 2.0);
    }

    #[test]
    fn test_form_body_round_trips_through_base64() {
        let payload = json!({"event": "e", "properties": {"a": 1}});
        let body = encode_form_body(&payload);

        let encoded = body.strip_prefix("data=").unwrap();
        let decoded = urlencoding::decode(encoded).unwrap();
        let bytes = BASE64.decode(decoded.as_bytes()).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_config_defaults_to_public_api_host() {
        let config = MixpanelConfig::new("tok");
        assert_eq!(config.api_host, DEFAULT_API_HOST);

        let config = config.with_api_host("https://proxy.example.com");
        assert_eq!(config.api_host, "https://proxy.example.com");
    }
}

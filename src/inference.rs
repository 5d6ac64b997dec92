//! Client for the GSR inference backend.
//!
//! The backend exposes the most recent prediction at `GET /latest` and a
//! liveness page at `GET /`. Each call here is a single request/response
//! exchange with a client-side timeout and no internal retry; the
//! reconciliation loop's next tick is the retry.

use crate::core::{parse_observed_at, Classification, Reading};
use async_trait::async_trait;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Inference backend configuration.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Base URL, e.g. `http://localhost:5000`
    pub base_url: String,
    /// Bound on each request
    pub timeout: Duration,
    /// Timezone of the backend's naive timestamps
    pub timezone: Tz,
}

impl InferenceConfig {
    /// Create a new inference configuration with the default 5s timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            timezone: Tz::UTC,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Get the base URL without a trailing slash.
    pub fn url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Get the latest-reading endpoint URL.
    pub fn latest_url(&self) -> String {
        format!("{}/latest", self.url())
    }

    /// Get the liveness endpoint URL.
    pub fn probe_url(&self) -> String {
        format!("{}/", self.url())
    }
}

/// Inference fetch error types.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Backend unreachable or the connection failed
    #[error("Inference backend unreachable: {0}")]
    Network(String),
    /// No response within the client-side timeout
    #[error("Inference request timed out after {0:?}")]
    Timeout(Duration),
    /// Backend answered with a non-success status
    #[error("Inference backend error ({status}): {message}")]
    Status { status: u16, message: String },
    /// Body was not a valid reading
    #[error("Malformed inference payload: {0}")]
    Malformed(String),
    /// HTTP client could not be constructed
    #[error("Inference client setup failed: {0}")]
    Client(String),
}

impl FetchError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Anything that can produce the latest reading on demand.
#[async_trait]
pub trait InferenceSource: Send + Sync {
    /// Fetch the latest reading once.
    async fn poll(&self) -> Result<Reading, FetchError>;

    /// Check whether the backend is reachable.
    async fn probe(&self) -> bool;
}

/// `/latest` body as the backend writes it.
#[derive(Debug, Deserialize)]
struct LatestPayload {
    gsr_value: Option<f64>,
    emotion: ClassificationPayload,
    mwl: ClassificationPayload,
}

#[derive(Debug, Deserialize)]
struct ClassificationPayload {
    prediction: Option<String>,
    confidence: Option<f64>,
    timestamp: Option<String>,
    #[serde(default)]
    all_percentages: Option<BTreeMap<String, f64>>,
}

/// Error body the backend sends with non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: Option<String>,
}

impl ClassificationPayload {
    fn into_classification(self, tz: Tz) -> Result<Classification, String> {
        let observed_at = self
            .timestamp
            .as_deref()
            .map(|raw| parse_observed_at(raw, tz))
            .transpose()?;

        Ok(Classification {
            label: self.prediction,
            confidence: self.confidence,
            observed_at,
            distribution: self.all_percentages,
        })
    }
}

/// Decode a `/latest` body into a validated `Reading`.
pub fn decode_reading(body: &str, tz: Tz) -> Result<Reading, FetchError> {
    let payload: LatestPayload =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    let sensor_value = payload
        .gsr_value
        .ok_or_else(|| FetchError::Malformed("gsr_value is missing".to_string()))?;

    let reading = Reading {
        sensor_value,
        emotion: payload
            .emotion
            .into_classification(tz)
            .map_err(|e| FetchError::Malformed(format!("emotion: {e}")))?,
        workload: payload
            .mwl
            .into_classification(tz)
            .map_err(|e| FetchError::Malformed(format!("mwl: {e}")))?,
    };

    reading.validate().map_err(FetchError::Malformed)?;
    Ok(reading)
}

/// HTTP client for the inference backend.
pub struct InferenceClient {
    config: InferenceConfig,
    client: reqwest::Client,
}

impl InferenceClient {
    /// Create a new inference client.
    pub fn new(config: InferenceConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Fetch the latest reading.
    pub async fn latest(&self) -> Result<Reading, FetchError> {
        let response = self
            .client
            .get(self.config.latest_url())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, self.config.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(e, self.config.timeout))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorPayload>(&body)
                .ok()
                .and_then(|p| p.message)
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("Unknown error")
                        .to_string()
                });
            return Err(FetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        decode_reading(&body, self.config.timezone)
    }

    /// Test connection to the backend.
    pub async fn test_connection(&self) -> Result<bool, FetchError> {
        let response = self
            .client
            .get(self.config.probe_url())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, self.config.timeout))?;

        Ok(response.status().is_success())
    }

    /// Get the configuration this client talks to.
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}

#[async_trait]
impl InferenceSource for InferenceClient {
    async fn poll(&self) -> Result<Reading, FetchError> {
        self.latest().await
    }

    async fn probe(&self) -> bool {
        match self.test_connection().await {
            Ok(reachable) => reachable,
            Err(e) => {
                tracing::debug!("Liveness probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LATEST_BODY: &str = r#"{
        "gsr_value": 4.21,
        "emotion": {
            "prediction": "Calm",
            "confidence": 72.4,
            "timestamp": "2025-03-01 08:30:00",
            "all_percentages": {"Calm": 72.4, "Stressed": 27.6}
        },
        "mwl": {
            "prediction": "Low MWL",
            "confidence": 64.0,
            "timestamp": "2025-03-01 08:30:00",
            "all_percentages": null
        }
    }"#;

    fn client_for(server: &MockServer) -> InferenceClient {
        InferenceClient::new(
            InferenceConfig::new(server.uri()).with_timeout(Duration::from_millis(500)),
        )
        .unwrap()
    }

    #[test]
    fn test_inference_config_urls() {
        let config = InferenceConfig::new("http://127.0.0.1:5000/");
        assert_eq!(config.url(), "http://127.0.0.1:5000");
        assert_eq!(config.latest_url(), "http://127.0.0.1:5000/latest");
        assert_eq!(config.probe_url(), "http://127.0.0.1:5000/");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_decode_full_payload() {
        let reading = decode_reading(LATEST_BODY, Tz::UTC).unwrap();
        assert_eq!(reading.sensor_value, 4.21);
        assert_eq!(reading.emotion.label.as_deref(), Some("Calm"));
        assert_eq!(reading.emotion.distribution.as_ref().unwrap()["Stressed"], 27.6);
        assert_eq!(reading.workload.label.as_deref(), Some("Low MWL"));
        assert!(reading.workload.distribution.is_none());
        assert_eq!(
            reading.emotion.observed_at.unwrap().to_rfc3339(),
            "2025-03-01T08:30:00+00:00"
        );
    }

    #[test]
    fn test_decode_model_not_loaded() {
        let body = r#"{
            "gsr_value": 3.0,
            "emotion": {"prediction": null, "confidence": null, "timestamp": "2025-03-01 08:30:00"},
            "mwl": {"prediction": null, "confidence": null, "timestamp": null}
        }"#;
        let reading = decode_reading(body, Tz::UTC).unwrap();
        assert!(reading.emotion.label.is_none());
        assert!(reading.workload.observed_at.is_none());
    }

    #[test]
    fn test_decode_rejects_missing_sample() {
        let body = r#"{
            "gsr_value": null,
            "emotion": {"prediction": null, "confidence": null, "timestamp": null},
            "mwl": {"prediction": null, "confidence": null, "timestamp": null}
        }"#;
        assert!(matches!(
            decode_reading(body, Tz::UTC),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_confidence() {
        let body = r#"{
            "gsr_value": 4.0,
            "emotion": {"prediction": "Calm", "confidence": 172.4, "timestamp": null},
            "mwl": {"prediction": "Low MWL", "confidence": 50.0, "timestamp": null}
        }"#;
        assert!(matches!(
            decode_reading(body, Tz::UTC),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            decode_reading("<html>oops</html>", Tz::UTC),
            Err(FetchError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LATEST_BODY))
            .mount(&server)
            .await;

        let reading = client_for(&server).poll().await.unwrap();
        assert_eq!(reading.sensor_value, 4.21);
    }

    #[tokio::test]
    async fn test_latest_no_data_yet() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string(r#"{"status": "error", "message": "No data yet"}"#),
            )
            .mount(&server)
            .await;

        match client_for(&server).poll().await {
            Err(FetchError::Status { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "No data yet");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_latest_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server).poll().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 500, .. }));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_latest_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(LATEST_BODY)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).poll().await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Server is running"))
            .mount(&server)
            .await;

        assert!(client_for(&server).probe().await);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let client = InferenceClient::new(
            InferenceConfig::new("http://127.0.0.1:9").with_timeout(Duration::from_millis(300)),
        )
        .unwrap();
        assert!(!client.probe().await);
    }
}

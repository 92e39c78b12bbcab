//! HTTP client for the analysis service
//!
//! One `reqwest::Client` per controller, configured with the request timeout
//! from settings. All routes live under `{base}/api/v1`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use super::session::RecordingSession;
use crate::audio::AudioBlob;
use crate::error::FlowError;

const API_PREFIX: [&str; 2] = ["api", "v1"];

/// Quality score range reported by the service
pub const MAX_QUALITY_SCORE: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FlowError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| FlowError::Unknown(format!("Invalid API URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FlowError::Unknown(format!(
                "Invalid API URL '{}': not a base URL",
                base_url
            )));
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowError::Unknown(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Absolute URL for an API route; each segment is percent-encoded
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(API_PREFIX.iter().chain(segments.iter()));
        }
        url
    }
}

/// Which analysis endpoint a clip goes to, decided once per submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisRoute {
    Legacy,
    Session(String),
}

impl AnalysisRoute {
    pub fn for_session(session: &RecordingSession) -> Self {
        match session.session_id() {
            Some(id) => AnalysisRoute::Session(id.to_string()),
            None => AnalysisRoute::Legacy,
        }
    }

    pub fn segments(&self) -> Vec<&str> {
        match self {
            AnalysisRoute::Legacy => vec!["analyze"],
            AnalysisRoute::Session(id) => vec!["recording-session", id.as_str(), "analyze"],
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, AnalysisRoute::Session(_))
    }
}

/// Successful analysis response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(rename = "pesq_score")]
    pub quality_score: f64,
    #[serde(rename = "snr_db")]
    pub signal_to_noise_db: f64,
    #[serde(rename = "sample_rate")]
    pub sample_rate_hz: u32,
    pub quality_category: String,
}

impl AnalysisResult {
    /// Position of the score marker along the 0-4 scale, in percent
    pub fn marker_percent(&self) -> f64 {
        self.quality_score.clamp(0.0, MAX_QUALITY_SCORE) / MAX_QUALITY_SCORE * 100.0
    }
}

/// Extract the server's `detail` from an error body.
///
/// `detail` may be a string or a structured validation error; anything that
/// is not JSON is passed through as text.
pub fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("detail") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        },
        Err(_) => Some(body.to_string()),
    }
}

#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn analyze(
        &self,
        route: &AnalysisRoute,
        blob: &AudioBlob,
        file_name: &str,
    ) -> Result<AnalysisResult, FlowError>;
}

pub struct HttpAnalysisApi {
    client: ApiClient,
}

impl HttpAnalysisApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnalysisApi for HttpAnalysisApi {
    async fn analyze(
        &self,
        route: &AnalysisRoute,
        blob: &AudioBlob,
        file_name: &str,
    ) -> Result<AnalysisResult, FlowError> {
        let url = self.client.endpoint(&route.segments());
        log::info!(
            "Sending {} bytes ({}) for analysis: {}",
            blob.len(),
            blob.mime_type(),
            url
        );

        let file_part = Part::bytes(blob.as_bytes().to_vec())
            .file_name(file_name.to_string())
            .mime_str(blob.mime_type())
            .map_err(|e| FlowError::AnalysisFailed {
                status: None,
                detail: Some(format!("invalid MIME type '{}': {}", blob.mime_type(), e)),
            })?;
        let form = Form::new().part("file", file_part);

        let response = self
            .client
            .http()
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FlowError::AnalysisFailed {
                status: None,
                detail: Some(e.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = error_detail(&body);
            log::error!("Analysis API error ({}): {:?}", status.as_u16(), detail);
            return Err(FlowError::AnalysisFailed {
                status: Some(status.as_u16()),
                detail,
            });
        }

        let result: AnalysisResult = response.json().await.map_err(|e| {
            FlowError::AnalysisFailed {
                status: Some(status.as_u16()),
                detail: Some(format!("invalid analysis response: {}", e)),
            }
        })?;

        log::info!(
            "Analysis complete: score={:.2} snr={:.1}dB rate={}Hz category={}",
            result.quality_score,
            result.signal_to_noise_db,
            result.sample_rate_hz,
            result.quality_category
        );
        Ok(result)
    }
}

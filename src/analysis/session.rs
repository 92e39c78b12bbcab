//! Recording-session negotiation
//!
//! A session correlates one capture/analysis cycle with the device metadata
//! sent up front. Failing to open one is never fatal: the cycle continues
//! with an absent session and the analysis goes to the legacy route.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::client::ApiClient;
use crate::audio::DeviceProfile;
use crate::error::FlowError;

/// Placeholder sent when the client IP cannot be resolved
pub const UNKNOWN_IP: &str = "unknown";

/// Server-side session handle for one cycle. Absent means "use the legacy route".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    session_id: Option<String>,
}

impl RecordingSession {
    pub fn absent() -> Self {
        Self { session_id: None }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_absent(&self) -> bool {
        self.session_id.is_none()
    }
}

#[derive(Debug, Serialize)]
struct SessionStartRequest<'a> {
    device_name: &'a str,
    ip_address: &'a str,
    audio_format: &'a str,
    microphone_details: &'a str,
    speaker_details: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionStartResponse {
    recording_session_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// Opens a session for a device profile, resolving fingerprint and IP itself
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn open_session(&self, profile: &DeviceProfile) -> Result<RecordingSession, FlowError>;
}

/// Best-effort public IP lookup
pub struct IpResolver {
    http: reqwest::Client,
    lookup_url: String,
}

impl IpResolver {
    pub fn new(http: reqwest::Client, lookup_url: impl Into<String>) -> Self {
        Self {
            http,
            lookup_url: lookup_url.into(),
        }
    }

    /// Resolve the client's public IP; any failure yields `"unknown"`
    pub async fn resolve(&self) -> String {
        match self.lookup().await {
            Ok(ip) if !ip.trim().is_empty() => ip,
            Ok(_) => {
                log::warn!("IP lookup returned an empty address");
                UNKNOWN_IP.to_string()
            }
            Err(e) => {
                log::warn!("IP lookup failed: {}", e);
                UNKNOWN_IP.to_string()
            }
        }
    }

    async fn lookup(&self) -> Result<String, reqwest::Error> {
        let response: IpResponse = self
            .http
            .get(&self.lookup_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.ip)
    }
}

/// Identifies this client to the session service:
/// `voicecheck/<version>|<os>|<arch>|<language>|<utc offset>`
pub fn client_fingerprint() -> String {
    let language = std::env::var("LANG")
        .ok()
        .and_then(|lang| normalize_language(&lang))
        .unwrap_or_else(|| "en-US".to_string());
    let offset = chrono::Local::now().offset().to_string();

    format!(
        "voicecheck/{}|{}|{}|{}|{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        language,
        offset
    )
}

/// `en_US.UTF-8` -> `en-US`; `C`/`POSIX` carry no language
fn normalize_language(lang: &str) -> Option<String> {
    let tag = lang.split(['.', '@']).next().unwrap_or_default();
    if tag.is_empty() || tag == "C" || tag == "POSIX" {
        return None;
    }
    Some(tag.replace('_', "-"))
}

pub struct SessionClient {
    client: ApiClient,
    ip: IpResolver,
}

impl SessionClient {
    pub fn new(client: ApiClient, ip_lookup_url: impl Into<String>) -> Self {
        let ip = IpResolver::new(client.http().clone(), ip_lookup_url);
        Self { client, ip }
    }

    /// Issue one session-start request with the given metadata
    pub async fn start_session(
        &self,
        profile: &DeviceProfile,
        fingerprint: &str,
        client_ip: &str,
    ) -> Result<RecordingSession, FlowError> {
        let request = SessionStartRequest {
            device_name: fingerprint,
            ip_address: client_ip,
            audio_format: &profile.codec_format,
            microphone_details: &profile.input_device_label,
            speaker_details: &profile.output_device_label,
        };
        log::debug!("Starting recording session: {:?}", request);

        let url = self.client.endpoint(&["recording-session", "start"]);
        let response = self
            .client
            .http()
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FlowError::SessionStartFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlowError::SessionStartFailed(format!(
                "session service returned {}",
                status.as_u16()
            )));
        }

        let body: SessionStartResponse = response
            .json()
            .await
            .map_err(|e| FlowError::SessionStartFailed(format!("invalid response: {}", e)))?;

        // Ids are opaque; numeric ids are accepted as their decimal text
        let id = match body.recording_session_id {
            serde_json::Value::String(s) if !s.is_empty() => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(FlowError::SessionStartFailed(format!(
                    "missing recording_session_id (got {})",
                    other
                )))
            }
        };

        log::info!("Recording session started: {}", id);
        Ok(RecordingSession::with_id(id))
    }
}

#[async_trait]
impl SessionApi for SessionClient {
    async fn open_session(&self, profile: &DeviceProfile) -> Result<RecordingSession, FlowError> {
        let client_ip = self.ip.resolve().await;
        self.start_session(profile, &client_fingerprint(), &client_ip)
            .await
    }
}

//! Error taxonomy for the recording/analysis flow
//!
//! Every collaborator reports failures through `FlowError`. The controller
//! decides per variant whether the cycle aborts, falls back, or continues.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// User (or the platform) declined microphone access
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable input device, or the probe stream and enumeration disagree
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No encoding format is supported by both the runtime and the preference list
    #[error("No supported audio encoding (wanted one of: {0})")]
    EncoderUnavailable(String),

    /// Session negotiation failed; the flow continues on the legacy route
    #[error("Failed to start recording session: {0}")]
    SessionStartFailed(String),

    /// A slice of the finished clip could not be read
    #[error("Failed to read audio chunk: {0}")]
    ChunkReadError(String),

    /// Remote analysis returned a non-success status or the request never completed
    #[error("{}", describe_analysis_failure(.status, .detail))]
    AnalysisFailed {
        status: Option<u16>,
        detail: Option<String>,
    },

    /// Upload to remote storage failed (analysis still proceeds)
    #[error("Recording upload failed: {0}")]
    StorageFailed(String),

    #[error("No recorded audio data available")]
    EmptyCapture,

    /// A capture, processing or analysis step is already running
    #[error("A recording is already in progress")]
    Busy,

    #[error("{0}")]
    Unknown(String),
}

fn describe_analysis_failure(status: &Option<u16>, detail: &Option<String>) -> String {
    let detail = detail.as_deref().unwrap_or("no detail");
    match status {
        Some(code) => format!("API response: {} | {}", code, detail),
        None => format!("Analysis request failed: {}", detail),
    }
}

impl FlowError {
    /// Fatal errors end the current cycle in the error state.
    /// Session-start and storage failures only change the path taken.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FlowError::SessionStartFailed(_) | FlowError::StorageFailed(_)
        )
    }

    /// Short machine-readable category, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::PermissionDenied(_) => "permission_denied",
            FlowError::DeviceUnavailable(_) => "device_unavailable",
            FlowError::EncoderUnavailable(_) => "encoder_unavailable",
            FlowError::SessionStartFailed(_) => "session_start_failed",
            FlowError::ChunkReadError(_) => "chunk_read_error",
            FlowError::AnalysisFailed { .. } => "analysis_failed",
            FlowError::StorageFailed(_) => "storage_failed",
            FlowError::EmptyCapture => "empty_capture",
            FlowError::Busy => "busy",
            FlowError::Unknown(_) => "unknown",
        }
    }
}

//! Remote side of the flow: recording sessions and quality analysis

pub mod client;
pub mod dispatcher;
pub mod session;

pub use client::{
    error_detail, AnalysisApi, AnalysisResult, AnalysisRoute, ApiClient, HttpAnalysisApi,
};
pub use dispatcher::{analysis_file_name, AnalysisDispatcher, SyntheticProgress};
pub use session::{client_fingerprint, IpResolver, RecordingSession, SessionApi, SessionClient};

//! Audio side of the flow
//!
//! Device negotiation, microphone capture with a live waveform, and the
//! chunked read-through of the finished clip. Uses CPAL for capture and
//! hound for WAV encoding.

pub mod capture;
pub mod chunked;
pub mod devices;
pub mod recorder;
pub mod waveform;

pub use capture::{
    negotiate_codec, AudioBlob, CaptureBackend, CapturePhase, CaptureSession, CaptureStream,
    SegmentSink, FALLBACK_CODEC,
};
pub use chunked::{BlobSource, ChunkedProcessor, DEFAULT_CHUNK_SIZE};
pub use devices::{
    CpalDeviceBackend, DeviceBackend, DeviceDescriptor, DeviceKind, DeviceProfile,
    PermissionNegotiator, ProbeStream,
};
pub use recorder::CpalCaptureBackend;
pub use waveform::{
    LevelAnalyzer, NullWaveformSink, SharedLevels, TerminalWaveform, WaveformConfig,
    WaveformFrame, WaveformSink,
};

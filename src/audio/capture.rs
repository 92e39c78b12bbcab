//! Capture session: microphone stream, encoder and live analyzer
//!
//! Phases: `Idle -> Arming -> Active -> Finalizing -> Idle`.
//! Encoded segments may only be appended while `Active`, so on stop the
//! encoder is flushed into the sink before the phase moves on. The hardware is
//! then released and the buffered segments are concatenated into one
//! immutable `AudioBlob`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::devices::DeviceProfile;
use super::waveform::{spawn_renderer, LevelAnalyzer, RendererHandle, WaveformConfig, WaveformSink};
use crate::error::FlowError;

/// Format reported to the session API when negotiation found nothing
pub const FALLBACK_CODEC: &str = "audio/webm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    Arming,
    Active,
    Finalizing,
}

/// Finalized recording. Cheap to clone; never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioBlob {
    bytes: Arc<[u8]>,
    mime_type: String,
}

impl AudioBlob {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn empty(mime_type: impl Into<String>) -> Self {
        Self::new(Vec::new(), mime_type)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }
}

impl fmt::Debug for AudioBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBlob")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Ordered encoded segments of the current capture
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    segments: Vec<Vec<u8>>,
}

impl CaptureBuffer {
    /// Zero-length segments are dropped
    fn push(&mut self, segment: Vec<u8>) {
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn byte_len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    fn finalize(self, mime_type: &str) -> AudioBlob {
        AudioBlob::new(self.segments.concat(), mime_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("segment rejected: capture is {0:?}")]
pub struct SegmentRejected(pub CapturePhase);

struct CaptureInner {
    phase: CapturePhase,
    buffer: CaptureBuffer,
}

fn lock_inner(inner: &Mutex<CaptureInner>) -> MutexGuard<'_, CaptureInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Entry point for the encoder callback (`appendSegment`)
#[derive(Clone)]
pub struct SegmentSink {
    inner: Arc<Mutex<CaptureInner>>,
}

impl SegmentSink {
    pub fn append(&self, segment: Vec<u8>) -> Result<(), SegmentRejected> {
        let mut inner = lock_inner(&self.inner);
        if inner.phase != CapturePhase::Active {
            log::debug!(
                "Dropping {} byte segment outside active capture ({:?})",
                segment.len(),
                inner.phase
            );
            return Err(SegmentRejected(inner.phase));
        }
        inner.buffer.push(segment);
        Ok(())
    }
}

/// Platform capture: microphone + encoder
pub trait CaptureBackend: Send + Sync {
    /// Encoding formats (MIME types) this runtime can produce
    fn supported_formats(&self) -> Vec<String>;

    /// Open the microphone and start encoding into `segments`
    fn open(&self, format: &str, segments: SegmentSink)
        -> Result<Box<dyn CaptureStream>, FlowError>;
}

/// An open microphone stream
pub trait CaptureStream: Send {
    fn analyzer(&self) -> Arc<dyn LevelAnalyzer>;

    /// Flush the encoder into the stream's `SegmentSink` and release all
    /// hardware tracks. Called while the capture is still `Active`.
    /// Hardware must be released even on error.
    fn finish(self: Box<Self>) -> Result<(), FlowError>;
}

/// First format in `preferences` that the runtime supports (case-insensitive)
pub fn negotiate_codec(preferences: &[String], supported: &[String]) -> Option<String> {
    preferences
        .iter()
        .find(|wanted| supported.iter().any(|s| s.eq_ignore_ascii_case(wanted)))
        .cloned()
}

pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    preferences: Vec<String>,
    waveform_sink: Arc<dyn WaveformSink>,
    waveform: WaveformConfig,
    inner: Arc<Mutex<CaptureInner>>,
    format: String,
    stream: Option<Box<dyn CaptureStream>>,
    renderer: Option<RendererHandle>,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        preferences: Vec<String>,
        waveform_sink: Arc<dyn WaveformSink>,
        waveform: WaveformConfig,
    ) -> Self {
        Self {
            backend,
            preferences,
            waveform_sink,
            waveform,
            inner: Arc::new(Mutex::new(CaptureInner {
                phase: CapturePhase::Idle,
                buffer: CaptureBuffer::default(),
            })),
            format: FALLBACK_CODEC.to_string(),
            stream: None,
            renderer: None,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        lock_inner(&self.inner).phase
    }

    pub fn segment_sink(&self) -> SegmentSink {
        SegmentSink {
            inner: self.inner.clone(),
        }
    }

    /// Bytes buffered so far in the current capture
    pub fn buffered_bytes(&self) -> usize {
        lock_inner(&self.inner).buffer.byte_len()
    }

    fn set_phase(&self, phase: CapturePhase) {
        lock_inner(&self.inner).phase = phase;
    }

    /// Open the microphone and begin capturing.
    ///
    /// Must be called from within a Tokio runtime (the waveform loop is spawned on it).
    pub fn start(&mut self, profile: &DeviceProfile) -> Result<(), FlowError> {
        let phase = self.phase();
        if phase != CapturePhase::Idle {
            log::warn!("Capture start rejected: session is {:?}", phase);
            return Err(FlowError::Busy);
        }

        let mut wanted = vec![profile.codec_format.clone()];
        wanted.extend(
            self.preferences
                .iter()
                .filter(|p| **p != profile.codec_format)
                .cloned(),
        );
        let supported = self.backend.supported_formats();
        let format = negotiate_codec(&wanted, &supported)
            .ok_or_else(|| FlowError::EncoderUnavailable(wanted.join(", ")))?;

        {
            let mut inner = lock_inner(&self.inner);
            inner.phase = CapturePhase::Arming;
            inner.buffer = CaptureBuffer::default();
        }

        let stream = match self.backend.open(&format, self.segment_sink()) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to open capture stream: {}", e);
                self.set_phase(CapturePhase::Idle);
                return Err(e);
            }
        };

        self.renderer = Some(spawn_renderer(
            stream.analyzer(),
            self.waveform_sink.clone(),
            self.waveform,
        ));
        self.stream = Some(stream);
        self.format = format;
        self.set_phase(CapturePhase::Active);

        log::info!(
            "Capture active: input={:?}, format={}",
            profile.input_device_label,
            self.format
        );
        Ok(())
    }

    /// Stop capturing and return the finalized clip.
    ///
    /// Returns `None` when no capture is running. Partial captures are
    /// returned as-is; an encoder flush failure keeps what was already buffered.
    pub fn stop(&mut self) -> Option<AudioBlob> {
        match self.phase() {
            CapturePhase::Idle | CapturePhase::Finalizing => return None,
            CapturePhase::Arming | CapturePhase::Active => {}
        }

        if let Some(renderer) = self.renderer.take() {
            renderer.stop();
        }

        // The last encoded data still lands through the sink
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.finish() {
                log::warn!("Encoder flush failed, keeping buffered audio: {}", e);
            }
        }
        self.set_phase(CapturePhase::Finalizing);

        let blob = {
            let mut inner = lock_inner(&self.inner);
            let buffer = std::mem::take(&mut inner.buffer);
            log::info!(
                "Capture finalized: {} segments, {} bytes",
                buffer.segment_count(),
                buffer.byte_len()
            );
            let blob = buffer.finalize(&self.format);
            inner.phase = CapturePhase::Idle;
            blob
        };

        Some(blob)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.stop();
        }
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.finish() {
                log::warn!("Failed to release capture stream on drop: {}", e);
            }
        }
    }
}

//! Effect runner for the record-and-analyze flow
//!
//! Executes effects produced by the state machine against the collaborators
//! and reports completion back to the state loop as events tagged with the
//! cycle id. Capability flags from settings select which optional steps run
//! (session negotiation, remote storage upload).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::{
    analysis_file_name, AnalysisApi, AnalysisDispatcher, ApiClient, HttpAnalysisApi,
    RecordingSession, SessionApi, SessionClient,
};
use crate::audio::{
    negotiate_codec, AudioBlob, CaptureBackend, CaptureSession, ChunkedProcessor,
    CpalCaptureBackend, CpalDeviceBackend, DeviceBackend, PermissionNegotiator, WaveformSink,
    FALLBACK_CODEC,
};
use crate::countdown::{Countdown, CountdownError};
use crate::error::FlowError;
use crate::metrics::{MetricsCollector, RouteUsed};
use crate::progress::{ProgressReporter, ProgressSink, ProgressStage};
use crate::settings::{AppSettings, Capabilities};
use crate::state_machine::{Effect, Event};
use crate::storage::{HttpObjectStore, ObjectStore};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Everything the flow talks to outside its own state
#[derive(Clone)]
pub struct Collaborators {
    pub devices: Arc<dyn DeviceBackend>,
    pub capture: Arc<dyn CaptureBackend>,
    pub waveform_sink: Arc<dyn WaveformSink>,
    pub sessions: Arc<dyn SessionApi>,
    pub analysis: Arc<dyn AnalysisApi>,
    pub storage: Option<Arc<dyn ObjectStore>>,
}

impl Collaborators {
    /// Production wiring: CPAL devices and capture, HTTP session/analysis/storage clients
    pub fn from_settings(
        settings: &AppSettings,
        waveform_sink: Arc<dyn WaveformSink>,
    ) -> Result<Self, FlowError> {
        let api = ApiClient::new(&settings.api_base_url, settings.request_timeout())?;
        let sessions = SessionClient::new(api.clone(), settings.ip_lookup_url.clone());
        let analysis = HttpAnalysisApi::new(api);

        let storage = match settings.remote_storage_url() {
            Some(url) => Some(
                Arc::new(HttpObjectStore::new(url, settings.request_timeout())?)
                    as Arc<dyn ObjectStore>,
            ),
            None => None,
        };

        Ok(Self {
            devices: Arc::new(CpalDeviceBackend),
            capture: Arc::new(CpalCaptureBackend),
            waveform_sink,
            sessions: Arc::new(sessions),
            analysis: Arc::new(analysis),
            storage,
        })
    }
}

/// Real effect runner.
/// Owns the one capture session of its controller.
pub struct FlowEffectRunner {
    devices: Arc<dyn DeviceBackend>,
    capture_backend: Arc<dyn CaptureBackend>,
    sessions: Arc<dyn SessionApi>,
    storage: Option<Arc<dyn ObjectStore>>,
    capabilities: Capabilities,
    codec_preferences: Vec<String>,
    countdown_ticks: u32,
    countdown_interval: Duration,
    capture: Arc<Mutex<CaptureSession>>,
    active_recording: Arc<Mutex<Option<Uuid>>>,
    /// Registered before the countdown task is spawned
    countdowns: Arc<StdMutex<HashMap<Uuid, CancellationToken>>>,
    file_names: Arc<Mutex<HashMap<Uuid, String>>>,
    chunker: Arc<ChunkedProcessor>,
    dispatcher: Arc<AnalysisDispatcher>,
    progress: Arc<ProgressReporter>,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl FlowEffectRunner {
    pub fn new(
        settings: &AppSettings,
        collaborators: Collaborators,
        progress: Arc<ProgressReporter>,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Arc<Self> {
        let capture = CaptureSession::new(
            collaborators.capture.clone(),
            settings.codec_preferences.clone(),
            collaborators.waveform_sink.clone(),
            settings.waveform(),
        );
        let storage = if settings.capabilities.has_remote_storage {
            collaborators.storage
        } else {
            None
        };

        Arc::new(Self {
            devices: collaborators.devices,
            capture_backend: collaborators.capture,
            sessions: collaborators.sessions,
            storage,
            capabilities: settings.capabilities,
            codec_preferences: settings.codec_preferences.clone(),
            countdown_ticks: settings.countdown_ticks,
            countdown_interval: settings.countdown_interval(),
            capture: Arc::new(Mutex::new(capture)),
            active_recording: Arc::new(Mutex::new(None)),
            countdowns: Arc::new(StdMutex::new(HashMap::new())),
            file_names: Arc::new(Mutex::new(HashMap::new())),
            chunker: Arc::new(ChunkedProcessor::new(settings.chunk_size_bytes)),
            dispatcher: Arc::new(AnalysisDispatcher::new(
                collaborators.analysis,
                settings.synthetic_progress(),
            )),
            progress,
            metrics,
        })
    }

    fn countdown_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.countdowns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Codec reported in the device profile: first preference the runtime supports
    fn preferred_codec(&self) -> String {
        let supported = self.capture_backend.supported_formats();
        negotiate_codec(&self.codec_preferences, &supported).unwrap_or_else(|| {
            log::warn!(
                "No preferred codec supported (runtime offers {:?}), reporting {}",
                supported,
                FALLBACK_CODEC
            );
            FALLBACK_CODEC.to_string()
        })
    }
}

impl EffectRunner for FlowEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::AcquirePermission { id } => {
                let negotiator = PermissionNegotiator::new(self.devices.clone(), self.preferred_codec());
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    metrics.lock().await.start_cycle(id);

                    // Permission prompts and device enumeration block
                    let outcome = tokio::task::spawn_blocking(move || negotiator.acquire())
                        .await
                        .unwrap_or_else(|e| {
                            Err(FlowError::Unknown(format!("permission task failed: {}", e)))
                        });

                    match outcome {
                        Ok(profile) => {
                            let _ = tx.send(Event::PermissionGranted { id, profile }).await;
                        }
                        Err(error) => {
                            log::error!("Device access failed: {}", error);
                            metrics.lock().await.record_failure(&error);
                            let _ = tx.send(Event::PermissionFailed { id, error }).await;
                        }
                    }
                });
            }

            Effect::RunCountdown { id } => {
                let countdowns = self.countdowns.clone();
                let mut countdown = Countdown::new(self.countdown_ticks, self.countdown_interval);

                // A CancelCountdown spawned right after this must find the token
                let token = CancellationToken::new();
                self.countdown_tokens().insert(id, token.clone());

                tokio::spawn(async move {
                    let tick_tx = tx.clone();
                    let outcome = countdown
                        .run(&token, |remaining| {
                            if let Err(e) = tick_tx.try_send(Event::CountdownTick { id, remaining }) {
                                log::warn!("Dropped countdown tick {}: {}", remaining, e);
                            }
                        })
                        .await;
                    countdowns
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(&id);

                    match outcome {
                        Ok(()) => {
                            let _ = tx.send(Event::CountdownDone { id }).await;
                        }
                        Err(CountdownError::Cancelled) => {
                            log::info!("Countdown for cycle {} cancelled", id);
                        }
                        Err(CountdownError::AlreadyCompleted) => {
                            log::warn!("Countdown for cycle {} already completed", id);
                        }
                    }
                });
            }

            Effect::CancelCountdown { id } => {
                if let Some(token) = self.countdown_tokens().remove(&id) {
                    token.cancel();
                }
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    metrics.lock().await.cycle_cancelled(id);
                });
            }

            Effect::OpenSession { id, profile } => {
                if !self.capabilities.has_session_affinity {
                    log::debug!("Session affinity disabled; using legacy analysis");
                    tokio::spawn(async move {
                        let _ = tx
                            .send(Event::SessionOpened {
                                id,
                                session: RecordingSession::absent(),
                            })
                            .await;
                    });
                    return;
                }

                let sessions = self.sessions.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    match sessions.open_session(&profile).await {
                        Ok(session) => {
                            let _ = tx.send(Event::SessionOpened { id, session }).await;
                        }
                        Err(error) => {
                            log::warn!("Recording session unavailable: {}", error);
                            metrics.lock().await.record_failure(&error);
                            let _ = tx.send(Event::SessionFailed { id, error }).await;
                        }
                    }
                });
            }

            Effect::StartCapture { id, profile } => {
                let capture = self.capture.clone();
                let active = self.active_recording.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    // Opening the microphone blocks until the audio thread is ready
                    let mut session = capture.lock_owned().await;
                    let start_result =
                        tokio::task::spawn_blocking(move || session.start(&profile))
                            .await
                            .unwrap_or_else(|e| {
                                Err(FlowError::Unknown(format!("capture start task failed: {}", e)))
                            });

                    match start_result {
                        Ok(()) => {
                            *active.lock().await = Some(id);
                            metrics.lock().await.recording_started();
                            let _ = tx.send(Event::CaptureStarted { id }).await;
                        }
                        Err(error) => {
                            log::error!("Failed to start capture: {}", error);
                            metrics.lock().await.record_failure(&error);
                            let _ = tx.send(Event::CaptureFailed { id, error }).await;
                        }
                    }
                });
            }

            Effect::StartRecordingTick { id } => {
                let active = self.active_recording.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(1));
                    // First tick fires immediately
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        if *active.lock().await != Some(id) {
                            log::debug!("Recording tick stopping - recording {} no longer active", id);
                            break;
                        }
                        if tx.send(Event::RecordingTick { id }).await.is_err() {
                            log::debug!("Recording tick stopping - channel closed");
                            break;
                        }
                    }
                });
            }

            Effect::StopCapture { id } => {
                let capture = self.capture.clone();
                let active = self.active_recording.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    // Joins the audio thread
                    let mut session = capture.lock_owned().await;
                    let blob = tokio::task::spawn_blocking(move || session.stop())
                        .await
                        .unwrap_or_else(|e| {
                            log::error!("Capture stop task failed: {}", e);
                            None
                        });
                    {
                        let mut active = active.lock().await;
                        if *active == Some(id) {
                            *active = None;
                        }
                    }

                    let blob = blob.unwrap_or_else(|| {
                        log::warn!("StopCapture: no active capture for cycle {}", id);
                        AudioBlob::empty(FALLBACK_CODEC)
                    });

                    {
                        let mut m = metrics.lock().await;
                        m.recording_stopped(blob.len() as u64);
                        if blob.is_empty() {
                            m.record_failure(&FlowError::EmptyCapture);
                        }
                    }

                    let _ = tx.send(Event::CaptureStopped { id, blob }).await;
                });
            }

            Effect::ProcessChunks { id, blob } => {
                let chunker = self.chunker.clone();
                let storage = self.storage.clone();
                let file_names = self.file_names.clone();
                let progress = self.progress.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    progress.reset(ProgressStage::Upload);

                    if let Err(error) = chunker.walk(&blob, progress.as_ref()).await {
                        metrics.lock().await.record_failure(&error);
                        let _ = tx.send(Event::ChunksFailed { id, error }).await;
                        return;
                    }

                    let file_name = analysis_file_name(Utc::now());
                    file_names.lock().await.insert(id, file_name.clone());

                    if let Some(storage) = storage {
                        if let Err(error) = storage.put(&file_name, &blob).await {
                            log::warn!("Upload of {} failed, continuing to analysis: {}", file_name, error);
                            progress.set(ProgressStage::Upload, 100, true);
                            metrics.lock().await.record_failure(&error);
                            let _ = tx.send(Event::StorageFailed { id, error }).await;
                        }
                    }

                    let _ = tx.send(Event::ChunksProcessed { id }).await;
                });
            }

            Effect::SubmitAnalysis { id, blob, session } => {
                let dispatcher = self.dispatcher.clone();
                let file_names = self.file_names.clone();
                let progress = self.progress.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    let file_name = file_names
                        .lock()
                        .await
                        .remove(&id)
                        .unwrap_or_else(|| analysis_file_name(Utc::now()));

                    progress.reset(ProgressStage::Analysis);
                    let route = if session.is_absent() {
                        RouteUsed::Legacy
                    } else {
                        RouteUsed::Session
                    };
                    metrics.lock().await.analysis_started(route);

                    match dispatcher
                        .submit(&blob, &file_name, &session, progress.as_ref())
                        .await
                    {
                        Ok(result) => {
                            metrics.lock().await.cycle_scored(result.quality_score);
                            let _ = tx.send(Event::AnalysisOk { id, result }).await;
                        }
                        Err(error) => {
                            metrics.lock().await.record_failure(&error);
                            let _ = tx.send(Event::AnalysisFailed { id, error }).await;
                        }
                    }
                });
            }

            Effect::Notify(_) | Effect::EmitUi => {
                // Handled in the main loop, not here
                unreachable!("Notify and EmitUi are handled in run_state_loop");
            }
        }
    }
}

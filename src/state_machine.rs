//! State machine for the record-and-analyze flow
//!
//! Single-writer pattern: every transition goes through `reduce()`, which
//! returns the next state and the effects to run. Collaborators never touch
//! the state directly; they report back with events tagged by cycle id.

use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::analysis::{AnalysisResult, RecordingSession};
use crate::audio::{AudioBlob, DeviceProfile};
use crate::error::FlowError;

/// Captures are force-stopped after this long
pub const MAX_RECORDING_DURATION: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// User-facing message (toast)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    /// Fatal errors end the cycle and are shown as errors; fallbacks only warn
    pub fn from_error(err: &FlowError) -> Self {
        let level = if err.is_fatal() {
            NoticeLevel::Error
        } else {
            NoticeLevel::Warning
        };
        Self {
            level,
            message: err.to_string(),
        }
    }
}

/// Internal state of the flow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    /// Waiting for device access and device identities
    Negotiating {
        cycle_id: Uuid,
    },
    CountingDown {
        cycle_id: Uuid,
        profile: DeviceProfile,
        remaining: Option<u32>,
    },
    OpeningSession {
        cycle_id: Uuid,
        profile: DeviceProfile,
    },
    /// Capture requested, first segment not yet produced
    Arming {
        cycle_id: Uuid,
        session: RecordingSession,
        stop_requested: bool,
    },
    Recording {
        cycle_id: Uuid,
        session: RecordingSession,
        started_at: Instant,
    },
    Finalizing {
        cycle_id: Uuid,
        session: RecordingSession,
    },
    /// Chunk walk (and optional upload) of the finished clip
    Processing {
        cycle_id: Uuid,
        session: RecordingSession,
        blob: AudioBlob,
    },
    Analyzing {
        cycle_id: Uuid,
    },
    Done {
        cycle_id: Uuid,
        result: AnalysisResult,
    },
    Error {
        error: FlowError,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

impl State {
    pub fn cycle_id(&self) -> Option<Uuid> {
        match self {
            State::Idle | State::Error { .. } => None,
            State::Negotiating { cycle_id }
            | State::CountingDown { cycle_id, .. }
            | State::OpeningSession { cycle_id, .. }
            | State::Arming { cycle_id, .. }
            | State::Recording { cycle_id, .. }
            | State::Finalizing { cycle_id, .. }
            | State::Processing { cycle_id, .. }
            | State::Analyzing { cycle_id }
            | State::Done { cycle_id, .. } => Some(*cycle_id),
        }
    }

    /// A step of the current cycle is running; a new start must wait
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            State::Negotiating { .. }
                | State::CountingDown { .. }
                | State::OpeningSession { .. }
                | State::Finalizing { .. }
                | State::Processing { .. }
                | State::Analyzing { .. }
        )
    }
}

/// Events that can trigger state transitions.
/// User intents carry no id; collaborator completions carry the cycle id they belong to.
#[derive(Debug, Clone)]
pub enum Event {
    /// Record button: starts a cycle, or stops an active capture
    StartRequested,
    StopRequested,
    Cancel,
    /// Application exit requested
    Exit,

    PermissionGranted {
        id: Uuid,
        profile: DeviceProfile,
    },
    PermissionFailed {
        id: Uuid,
        error: FlowError,
    },

    CountdownTick {
        id: Uuid,
        remaining: u32,
    },
    CountdownDone {
        id: Uuid,
    },

    SessionOpened {
        id: Uuid,
        session: RecordingSession,
    },
    SessionFailed {
        id: Uuid,
        error: FlowError,
    },

    CaptureStarted {
        id: Uuid,
    },
    CaptureFailed {
        id: Uuid,
        error: FlowError,
    },
    /// Tick for the elapsed-time display and the duration cap
    RecordingTick {
        id: Uuid,
    },
    CaptureStopped {
        id: Uuid,
        blob: AudioBlob,
    },

    ChunksProcessed {
        id: Uuid,
    },
    ChunksFailed {
        id: Uuid,
        error: FlowError,
    },
    /// Remote storage upload failed; the cycle carries on
    StorageFailed {
        id: Uuid,
        error: FlowError,
    },

    AnalysisOk {
        id: Uuid,
        result: AnalysisResult,
    },
    AnalysisFailed {
        id: Uuid,
        error: FlowError,
    },
}

impl Event {
    fn cycle_id(&self) -> Option<Uuid> {
        use Event::*;
        match self {
            StartRequested | StopRequested | Cancel | Exit => None,
            PermissionGranted { id, .. }
            | PermissionFailed { id, .. }
            | CountdownTick { id, .. }
            | CountdownDone { id }
            | SessionOpened { id, .. }
            | SessionFailed { id, .. }
            | CaptureStarted { id }
            | CaptureFailed { id, .. }
            | RecordingTick { id }
            | CaptureStopped { id, .. }
            | ChunksProcessed { id }
            | ChunksFailed { id, .. }
            | StorageFailed { id, .. }
            | AnalysisOk { id, .. }
            | AnalysisFailed { id, .. } => Some(*id),
        }
    }
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    AcquirePermission {
        id: Uuid,
    },
    RunCountdown {
        id: Uuid,
    },
    CancelCountdown {
        id: Uuid,
    },
    OpenSession {
        id: Uuid,
        profile: DeviceProfile,
    },
    StartCapture {
        id: Uuid,
        profile: DeviceProfile,
    },
    /// Start sending RecordingTick events every second while recording
    StartRecordingTick {
        id: Uuid,
    },
    StopCapture {
        id: Uuid,
    },
    ProcessChunks {
        id: Uuid,
        blob: AudioBlob,
    },
    SubmitAnalysis {
        id: Uuid,
        blob: AudioBlob,
        session: RecordingSession,
    },
    Notify(Notice),
    /// Publish the UI snapshot
    EmitUi,
}

fn new_cycle() -> (State, Vec<Effect>) {
    let id = Uuid::new_v4();
    (
        State::Negotiating { cycle_id: id },
        vec![Effect::AcquirePermission { id }, Effect::EmitUi],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale cycle IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    if let Some(eid) = event.cycle_id() {
        if state.cycle_id() != Some(eid) {
            log::debug!("Dropping stale event for cycle {}", eid);
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Re-entry guard
        // -----------------
        (s, StartRequested) if s.is_busy() => {
            log::warn!("Start rejected: cycle {:?} still in progress", s.cycle_id());
            (state.clone(), vec![Notify(Notice::from_error(&FlowError::Busy))])
        }

        // -----------------
        // Idle / Done / Error
        // -----------------
        (Idle, StartRequested) | (Done { .. }, StartRequested) | (Error { .. }, StartRequested) => {
            new_cycle()
        }
        (Done { .. }, Cancel) | (Error { .. }, Cancel) => (Idle, vec![EmitUi]),

        // -----------------
        // Negotiating
        // -----------------
        (Negotiating { cycle_id }, PermissionGranted { profile, .. }) => (
            CountingDown {
                cycle_id: *cycle_id,
                profile,
                remaining: None,
            },
            vec![RunCountdown { id: *cycle_id }, EmitUi],
        ),
        // Nothing was opened; the controller stays idle
        (Negotiating { .. }, PermissionFailed { error, .. }) => {
            (Idle, vec![Notify(Notice::from_error(&error)), EmitUi])
        }
        (Negotiating { .. }, Cancel) => (Idle, vec![EmitUi]),

        // -----------------
        // CountingDown
        // -----------------
        (
            CountingDown {
                cycle_id, profile, ..
            },
            CountdownTick { remaining, .. },
        ) => (
            CountingDown {
                cycle_id: *cycle_id,
                profile: profile.clone(),
                remaining: Some(remaining),
            },
            vec![EmitUi],
        ),
        (CountingDown { cycle_id, profile, .. }, CountdownDone { .. }) => (
            OpeningSession {
                cycle_id: *cycle_id,
                profile: profile.clone(),
            },
            vec![
                OpenSession {
                    id: *cycle_id,
                    profile: profile.clone(),
                },
                EmitUi,
            ],
        ),
        (CountingDown { cycle_id, .. }, Cancel) => {
            (Idle, vec![CancelCountdown { id: *cycle_id }, EmitUi])
        }

        // -----------------
        // OpeningSession
        // -----------------
        (OpeningSession { cycle_id, profile }, SessionOpened { session, .. }) => (
            Arming {
                cycle_id: *cycle_id,
                session,
                stop_requested: false,
            },
            vec![
                StartCapture {
                    id: *cycle_id,
                    profile: profile.clone(),
                },
                EmitUi,
            ],
        ),
        // Not fatal: continue without a session, analysis takes the legacy route
        (OpeningSession { cycle_id, profile }, SessionFailed { error, .. }) => {
            log::warn!("Continuing without recording session: {}", error);
            (
                Arming {
                    cycle_id: *cycle_id,
                    session: RecordingSession::absent(),
                    stop_requested: false,
                },
                vec![
                    Notify(Notice::from_error(&error)),
                    StartCapture {
                        id: *cycle_id,
                        profile: profile.clone(),
                    },
                    EmitUi,
                ],
            )
        }
        (OpeningSession { .. }, Cancel) => (Idle, vec![EmitUi]),

        // -----------------
        // Arming
        // -----------------
        (
            Arming {
                cycle_id,
                session,
                stop_requested,
            },
            CaptureStarted { .. },
        ) => {
            if *stop_requested {
                (
                    Finalizing {
                        cycle_id: *cycle_id,
                        session: session.clone(),
                    },
                    vec![StopCapture { id: *cycle_id }, EmitUi],
                )
            } else {
                (
                    Recording {
                        cycle_id: *cycle_id,
                        session: session.clone(),
                        started_at: Instant::now(),
                    },
                    vec![StartRecordingTick { id: *cycle_id }, EmitUi],
                )
            }
        }
        (Arming { .. }, CaptureFailed { error, .. }) => {
            (Idle, vec![Notify(Notice::from_error(&error)), EmitUi])
        }
        // Stop before the stream is up: remember it and apply once active
        (Arming { cycle_id, session, .. }, StartRequested | StopRequested | Cancel) => (
            Arming {
                cycle_id: *cycle_id,
                session: session.clone(),
                stop_requested: true,
            },
            vec![],
        ),

        // -----------------
        // Recording
        // -----------------
        // Cancel still finalizes: partial captures are analyzed
        (Recording { cycle_id, session, .. }, StartRequested | StopRequested | Cancel) => (
            Finalizing {
                cycle_id: *cycle_id,
                session: session.clone(),
            },
            vec![StopCapture { id: *cycle_id }, EmitUi],
        ),
        (
            Recording {
                cycle_id,
                session,
                started_at,
            },
            RecordingTick { .. },
        ) => {
            let elapsed = started_at.elapsed();
            if elapsed >= MAX_RECORDING_DURATION {
                log::warn!(
                    "Recording {} auto-stopped after {:?} (max duration reached)",
                    cycle_id,
                    elapsed
                );
                (
                    Finalizing {
                        cycle_id: *cycle_id,
                        session: session.clone(),
                    },
                    vec![StopCapture { id: *cycle_id }, EmitUi],
                )
            } else {
                (state.clone(), vec![EmitUi])
            }
        }

        // -----------------
        // Finalizing
        // -----------------
        (Finalizing { .. }, CaptureStopped { blob, .. }) if blob.is_empty() => {
            let error = FlowError::EmptyCapture;
            (
                Error {
                    error: error.clone(),
                },
                vec![Notify(Notice::from_error(&error)), EmitUi],
            )
        }
        (Finalizing { cycle_id, session }, CaptureStopped { blob, .. }) => (
            Processing {
                cycle_id: *cycle_id,
                session: session.clone(),
                blob: blob.clone(),
            },
            vec![
                ProcessChunks {
                    id: *cycle_id,
                    blob,
                },
                EmitUi,
            ],
        ),

        // -----------------
        // Processing
        // -----------------
        (
            Processing {
                cycle_id,
                session,
                blob,
            },
            ChunksProcessed { .. },
        ) => (
            Analyzing {
                cycle_id: *cycle_id,
            },
            vec![
                SubmitAnalysis {
                    id: *cycle_id,
                    blob: blob.clone(),
                    session: session.clone(),
                },
                EmitUi,
            ],
        ),
        (Processing { .. }, ChunksFailed { error, .. }) => (
            Error {
                error: error.clone(),
            },
            vec![Notify(Notice::from_error(&error)), EmitUi],
        ),
        (_, StorageFailed { error, .. }) => {
            (state.clone(), vec![Notify(Notice::from_error(&error))])
        }

        // -----------------
        // Analyzing
        // -----------------
        (Analyzing { cycle_id }, AnalysisOk { result, .. }) => (
            Done {
                cycle_id: *cycle_id,
                result,
            },
            vec![EmitUi],
        ),
        (Analyzing { .. }, AnalysisFailed { error, .. }) => (
            Error {
                error: error.clone(),
            },
            vec![Notify(Notice::from_error(&error)), EmitUi],
        ),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> DeviceProfile {
        DeviceProfile {
            input_device_label: "USB Mic".into(),
            output_device_label: "Headphones".into(),
            codec_format: "audio/wav".into(),
        }
    }

    fn result() -> AnalysisResult {
        AnalysisResult {
            quality_score: 3.1,
            signal_to_noise_db: 22.0,
            sample_rate_hz: 48000,
            quality_category: "Good".into(),
        }
    }

    fn has<F: Fn(&Effect) -> bool>(effects: &[Effect], f: F) -> bool {
        effects.iter().any(f)
    }

    #[test]
    fn idle_start_begins_permission_negotiation() {
        let (next, effects) = reduce(&State::Idle, Event::StartRequested);
        assert!(matches!(next, State::Negotiating { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::AcquirePermission { .. })));
        assert!(has(&effects, |e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn permission_denied_returns_to_idle_without_session_or_capture() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::Negotiating { cycle_id: id },
            Event::PermissionFailed {
                id,
                error: FlowError::PermissionDenied("declined".into()),
            },
        );
        assert!(matches!(next, State::Idle));
        assert!(has(&effects, |e| matches!(
            e,
            Effect::Notify(Notice { level: NoticeLevel::Error, .. })
        )));
        assert!(!has(&effects, |e| matches!(
            e,
            Effect::OpenSession { .. } | Effect::StartCapture { .. }
        )));
    }

    #[test]
    fn full_happy_path() {
        let (state, _) = reduce(&State::Idle, Event::StartRequested);
        let id = state.cycle_id().unwrap();

        let (state, effects) = reduce(&state, Event::PermissionGranted { id, profile: profile() });
        assert!(matches!(state, State::CountingDown { remaining: None, .. }));
        assert!(has(&effects, |e| matches!(e, Effect::RunCountdown { .. })));

        let (state, _) = reduce(&state, Event::CountdownTick { id, remaining: 2 });
        assert!(matches!(state, State::CountingDown { remaining: Some(2), .. }));

        let (state, effects) = reduce(&state, Event::CountdownDone { id });
        assert!(matches!(state, State::OpeningSession { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::OpenSession { .. })));

        let (state, effects) = reduce(
            &state,
            Event::SessionOpened {
                id,
                session: RecordingSession::with_id("s-1"),
            },
        );
        assert!(matches!(state, State::Arming { stop_requested: false, .. }));
        assert!(has(&effects, |e| matches!(e, Effect::StartCapture { .. })));

        let (state, effects) = reduce(&state, Event::CaptureStarted { id });
        assert!(matches!(state, State::Recording { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::StartRecordingTick { .. })));

        let (state, effects) = reduce(&state, Event::StopRequested);
        assert!(matches!(state, State::Finalizing { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::StopCapture { .. })));

        let blob = AudioBlob::new(vec![1, 2, 3], "audio/wav");
        let (state, effects) = reduce(&state, Event::CaptureStopped { id, blob });
        assert!(matches!(state, State::Processing { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::ProcessChunks { .. })));

        let (state, effects) = reduce(&state, Event::ChunksProcessed { id });
        assert!(matches!(state, State::Analyzing { .. }));
        assert!(has(&effects, |e| matches!(
            e,
            Effect::SubmitAnalysis { session, .. } if session.session_id() == Some("s-1")
        )));

        let (state, _) = reduce(&state, Event::AnalysisOk { id, result: result() });
        assert!(matches!(state, State::Done { .. }));
    }

    #[test]
    fn session_failure_continues_with_absent_session() {
        let id = Uuid::new_v4();
        let state = State::OpeningSession {
            cycle_id: id,
            profile: profile(),
        };
        let (next, effects) = reduce(
            &state,
            Event::SessionFailed {
                id,
                error: FlowError::SessionStartFailed("500".into()),
            },
        );
        assert!(matches!(
            next,
            State::Arming { ref session, .. } if session.is_absent()
        ));
        assert!(has(&effects, |e| matches!(e, Effect::StartCapture { .. })));
        assert!(has(&effects, |e| matches!(
            e,
            Effect::Notify(Notice { level: NoticeLevel::Warning, .. })
        )));
    }

    #[test]
    fn stop_during_arming_is_applied_once_active() {
        let id = Uuid::new_v4();
        let state = State::Arming {
            cycle_id: id,
            session: RecordingSession::absent(),
            stop_requested: false,
        };
        let (state, effects) = reduce(&state, Event::StopRequested);
        assert!(matches!(state, State::Arming { stop_requested: true, .. }));
        assert!(effects.is_empty());

        let (state, effects) = reduce(&state, Event::CaptureStarted { id });
        assert!(matches!(state, State::Finalizing { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn start_while_busy_is_rejected_with_notice() {
        let id = Uuid::new_v4();
        let state = State::Analyzing { cycle_id: id };
        let (next, effects) = reduce(&state, Event::StartRequested);
        assert!(matches!(next, State::Analyzing { cycle_id } if cycle_id == id));
        assert_eq!(effects.len(), 1);
        assert!(has(&effects, |e| matches!(
            e,
            Effect::Notify(Notice { message, .. }) if message == &FlowError::Busy.to_string()
        )));
    }

    #[test]
    fn start_during_recording_toggles_stop() {
        let id = Uuid::new_v4();
        let state = State::Recording {
            cycle_id: id,
            session: RecordingSession::absent(),
            started_at: Instant::now(),
        };
        let (next, effects) = reduce(&state, Event::StartRequested);
        assert!(matches!(next, State::Finalizing { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn cancel_during_countdown_cancels_timer_and_returns_to_idle() {
        let id = Uuid::new_v4();
        let state = State::CountingDown {
            cycle_id: id,
            profile: profile(),
            remaining: Some(2),
        };
        let (next, effects) = reduce(&state, Event::Cancel);
        assert!(matches!(next, State::Idle));
        assert!(has(&effects, |e| matches!(e, Effect::CancelCountdown { .. })));
    }

    #[test]
    fn empty_capture_is_an_error() {
        let id = Uuid::new_v4();
        let state = State::Finalizing {
            cycle_id: id,
            session: RecordingSession::absent(),
        };
        let (next, effects) = reduce(
            &state,
            Event::CaptureStopped {
                id,
                blob: AudioBlob::empty("audio/wav"),
            },
        );
        assert!(matches!(next, State::Error { error: FlowError::EmptyCapture }));
        assert!(!has(&effects, |e| matches!(e, Effect::ProcessChunks { .. })));
    }

    #[test]
    fn chunk_and_analysis_failures_end_in_error_but_allow_restart() {
        let id = Uuid::new_v4();
        let state = State::Processing {
            cycle_id: id,
            session: RecordingSession::absent(),
            blob: AudioBlob::new(vec![1], "audio/wav"),
        };
        let (next, _) = reduce(
            &state,
            Event::ChunksFailed {
                id,
                error: FlowError::ChunkReadError("eof".into()),
            },
        );
        assert!(matches!(next, State::Error { .. }));

        let (next, effects) = reduce(
            &State::Analyzing { cycle_id: id },
            Event::AnalysisFailed {
                id,
                error: FlowError::AnalysisFailed {
                    status: Some(500),
                    detail: None,
                },
            },
        );
        assert!(matches!(next, State::Error { .. }));
        assert!(has(&effects, |e| matches!(e, Effect::Notify(_))));

        let (next, _) = reduce(&next, Event::StartRequested);
        assert!(matches!(next, State::Negotiating { .. }));
    }

    #[test]
    fn storage_failure_only_notifies() {
        let id = Uuid::new_v4();
        let state = State::Processing {
            cycle_id: id,
            session: RecordingSession::absent(),
            blob: AudioBlob::new(vec![1], "audio/wav"),
        };
        let (next, effects) = reduce(
            &state,
            Event::StorageFailed {
                id,
                error: FlowError::StorageFailed("403".into()),
            },
        );
        assert!(matches!(next, State::Processing { .. }));
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        let state = State::Negotiating { cycle_id: id };
        let (next, effects) = reduce(
            &state,
            Event::PermissionGranted {
                id: stale_id,
                profile: profile(),
            },
        );
        assert!(matches!(next, State::Negotiating { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn late_permission_after_cancel_is_dropped() {
        let (state, _) = reduce(&State::Idle, Event::StartRequested);
        let id = state.cycle_id().unwrap();
        let (state, _) = reduce(&state, Event::Cancel);
        assert!(matches!(state, State::Idle));

        let (state, effects) = reduce(&state, Event::PermissionGranted { id, profile: profile() });
        assert!(matches!(state, State::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn done_start_begins_new_cycle_with_new_id() {
        let old_id = Uuid::new_v4();
        let state = State::Done {
            cycle_id: old_id,
            result: result(),
        };
        let (next, _) = reduce(&state, Event::StartRequested);
        assert!(matches!(next, State::Negotiating { cycle_id } if cycle_id != old_id));
    }

    #[test]
    fn notice_level_follows_error_fatality() {
        let storage = Notice::from_error(&FlowError::StorageFailed("bucket offline".into()));
        assert_eq!(storage.level, NoticeLevel::Warning);
        assert_eq!(storage.message, "Recording upload failed: bucket offline");

        let analysis = Notice::from_error(&FlowError::AnalysisFailed {
            status: Some(500),
            detail: None,
        });
        assert_eq!(analysis.level, NoticeLevel::Error);
        assert_eq!(Notice::from_error(&FlowError::Busy).level, NoticeLevel::Error);
    }
}

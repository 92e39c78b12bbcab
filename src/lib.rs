pub mod analysis;
pub mod audio;
pub mod countdown;
pub mod effects;
pub mod error;
pub mod metrics;
pub mod progress;
pub mod settings;
pub mod state_machine;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use analysis::AnalysisResult;
use audio::{CpalDeviceBackend, DeviceBackend, DeviceKind, TerminalWaveform, WaveformSink};
use effects::{Collaborators, EffectRunner, FlowEffectRunner};
use metrics::MetricsCollector;
use progress::{ProgressReporter, ProgressStage};
use settings::AppSettings;
use state_machine::{reduce, Effect, Event, Notice, NoticeLevel, State};

/// UI state published to whatever front end is attached.
/// Uses tagged union format: { "status": "idle" } or { "status": "recording", "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiState {
    Idle,
    Negotiating,
    CountingDown {
        remaining: Option<u32>,
    },
    OpeningSession,
    Arming,
    Recording {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Finalizing,
    Processing,
    Analyzing,
    Done {
        result: AnalysisResult,
        #[serde(rename = "markerPercent")]
        marker_percent: f64,
    },
    Error {
        message: String,
        kind: String,
    },
}

/// Convert internal State to UiState for the front end
pub fn state_to_ui(state: &State) -> UiState {
    match state {
        State::Idle => UiState::Idle,
        State::Negotiating { .. } => UiState::Negotiating,
        State::CountingDown { remaining, .. } => UiState::CountingDown {
            remaining: *remaining,
        },
        State::OpeningSession { .. } => UiState::OpeningSession,
        State::Arming { .. } => UiState::Arming,
        State::Recording { started_at, .. } => UiState::Recording {
            elapsed_secs: started_at.elapsed().as_secs(),
        },
        State::Finalizing { .. } => UiState::Finalizing,
        State::Processing { .. } => UiState::Processing,
        State::Analyzing { .. } => UiState::Analyzing,
        State::Done { result, .. } => UiState::Done {
            marker_percent: result.marker_percent(),
            result: result.clone(),
        },
        State::Error { error } => UiState::Error {
            message: error.to_string(),
            kind: error.kind().to_string(),
        },
    }
}

/// Run the main state loop
pub async fn run_state_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui_tx: watch::Sender<UiState>,
    notice_tx: mpsc::Sender<Notice>,
) {
    let mut state = State::default();

    ui_tx.send_replace(state_to_ui(&state));
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down state loop");
            break;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => {
                    let ui = state_to_ui(&state);
                    log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui));
                    ui_tx.send_replace(ui);
                }
                Effect::Notify(notice) => {
                    if let Err(e) = notice_tx.try_send(notice) {
                        log::warn!("Dropped notice: {}", e);
                    }
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("State loop ended");
}

/// Handle to a running controller
pub struct ControllerHandle {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    progress: Arc<ProgressReporter>,
    metrics: Arc<Mutex<MetricsCollector>>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub fn ui(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    pub fn progress(&self, stage: ProgressStage) -> watch::Receiver<progress::ProgressState> {
        self.progress.subscribe(stage)
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Stop the state loop and wait for it to end
    pub async fn shutdown(self) {
        let _ = self.tx.send(Event::Exit).await;
        if let Err(e) = self.task.await {
            log::warn!("State loop task ended abnormally: {}", e);
        }
    }
}

/// Start a controller on the current Tokio runtime.
///
/// Returns the handle and the stream of user-facing notices.
pub fn spawn_controller(
    settings: &AppSettings,
    collaborators: Collaborators,
) -> (ControllerHandle, mpsc::Receiver<Notice>) {
    let (tx, rx) = mpsc::channel::<Event>(32);
    let (notice_tx, notice_rx) = mpsc::channel::<Notice>(16);
    let (ui_tx, ui_rx) = watch::channel(UiState::Idle);

    let progress = Arc::new(ProgressReporter::new());
    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
    let effect_runner = FlowEffectRunner::new(settings, collaborators, progress.clone(), metrics.clone());

    let tx_for_loop = tx.clone();
    let task = tokio::spawn(async move {
        run_state_loop(rx, tx_for_loop, effect_runner, ui_tx, notice_tx).await;
    });

    let handle = ControllerHandle {
        tx,
        ui: ui_rx,
        progress,
        metrics,
        task,
    };
    (handle, notice_rx)
}

// ============================================================================
// Command line front end
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "voicecheck", version, about = "Record a voice sample and score its quality")]
pub struct Cli {
    /// Settings file (defaults to <config dir>/voicecheck/settings.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Analysis service base URL
    #[arg(long)]
    pub api_url: Option<String>,

    /// Skip recording sessions and always use the legacy analysis route
    #[arg(long)]
    pub legacy: bool,

    /// Upload finished recordings to this storage base URL before analysis
    #[arg(long)]
    pub storage_url: Option<String>,

    /// List audio devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Write the resolved settings back to the settings file and exit
    #[arg(long)]
    pub save_config: bool,
}

impl Cli {
    pub fn settings_path(&self) -> Result<PathBuf, String> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => settings::default_settings_path(),
        }
    }

    /// Settings file plus environment and flag overrides, flags last
    pub fn resolve_settings(&self) -> Result<AppSettings, String> {
        let mut settings = settings::load_settings(&self.settings_path()?);
        settings.apply_env_overrides();

        if let Some(url) = &self.api_url {
            settings.api_base_url = url.clone();
        }
        if self.legacy {
            settings.capabilities.has_session_affinity = false;
        }
        if let Some(url) = &self.storage_url {
            settings.storage_url = Some(url.clone());
            settings.capabilities.has_remote_storage = true;
        }
        Ok(settings)
    }

    /// Persist the resolved settings so later runs need no flags
    pub fn save_resolved(&self) -> Result<PathBuf, String> {
        let path = self.settings_path()?;
        let settings = self.resolve_settings()?;
        settings::save_settings(&path, &settings)?;
        Ok(path)
    }
}

fn list_devices() -> Result<(), String> {
    let devices = CpalDeviceBackend.enumerate().map_err(|e| e.to_string())?;
    for device in devices {
        let kind = match device.kind {
            DeviceKind::Input => "input ",
            DeviceKind::Output => "output",
        };
        let marker = if device.is_default { "*" } else { " " };
        println!("{} {} {}", marker, kind, device.label);
    }
    Ok(())
}

fn print_ui(ui: &UiState) {
    match ui {
        UiState::Idle => eprintln!("\nReady. Press Enter to record, 'q' to quit."),
        UiState::CountingDown {
            remaining: Some(n),
        } => eprintln!("Recording in {}...", n),
        UiState::Recording { elapsed_secs: 0 } => {
            eprintln!("Recording. Press Enter to stop, 'c' to cancel.")
        }
        UiState::Analyzing => eprintln!("\nAnalyzing..."),
        UiState::Done {
            result,
            marker_percent,
        } => {
            println!(
                "Quality score: {:.2} ({}) | SNR {:.1} dB | {} Hz | marker at {:.0}%",
                result.quality_score,
                result.quality_category,
                result.signal_to_noise_db,
                result.sample_rate_hz,
                marker_percent
            );
            eprintln!("Press Enter to record again, 'q' to quit.");
        }
        UiState::Error { message, .. } => {
            eprintln!("\nError: {}", message);
            eprintln!("Press Enter to try again, 'q' to quit.");
        }
        _ => {}
    }
}

/// Interactive entry point: Enter starts/stops, 'c' cancels, 'q' quits
pub async fn run(cli: Cli) -> Result<(), String> {
    if cli.list_devices {
        return list_devices();
    }
    if cli.save_config {
        let path = cli.save_resolved()?;
        println!("Settings written to {}", path.display());
        return Ok(());
    }

    let settings = cli.resolve_settings()?;
    log::info!(
        "Analysis service: {} (session affinity: {}, remote storage: {})",
        settings.api_base_url,
        settings.capabilities.has_session_affinity,
        settings.capabilities.has_remote_storage
    );

    let waveform: Arc<dyn WaveformSink> = Arc::new(TerminalWaveform::new(48));
    let collaborators = Collaborators::from_settings(&settings, waveform).map_err(|e| e.to_string())?;
    let (controller, mut notices) = spawn_controller(&settings, collaborators);

    let mut ui = controller.ui();
    tokio::spawn(async move {
        print_ui(&ui.borrow_and_update().clone());
        while ui.changed().await.is_ok() {
            let current = ui.borrow_and_update().clone();
            print_ui(&current);
        }
    });

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice.level {
                NoticeLevel::Error => log::error!("{}", notice.message),
                NoticeLevel::Warning => log::warn!("{}", notice.message),
            }
        }
    });

    for stage in [ProgressStage::Upload, ProgressStage::Analysis] {
        let mut rx = controller.progress(stage);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if state.errored {
                    eprintln!("{} failed", state.stage.as_str());
                } else if state.percent == 100 {
                    eprintln!("{}: done", state.stage.as_str());
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read input: {}", e);
                break;
            }
        };

        let event = match line.trim() {
            "" => {
                if matches!(*controller.ui().borrow(), UiState::Recording { .. } | UiState::Arming) {
                    Event::StopRequested
                } else {
                    Event::StartRequested
                }
            }
            "c" | "cancel" => Event::Cancel,
            "q" | "quit" => break,
            other => {
                eprintln!("Unknown command '{}'", other);
                continue;
            }
        };

        if controller.send(event).await.is_err() {
            log::error!("State loop is gone");
            break;
        }
    }

    let summary = controller.metrics().lock().await.summary();
    log::info!(
        "Session summary: {} cycles, {} scored ({} via session), avg analysis {} ms",
        summary.total_cycles,
        summary.scored_cycles,
        summary.session_routed,
        summary.avg_analysis_ms
    );
    if let Some(score) = summary.avg_quality_score {
        log::info!("Average quality score: {:.2}", score);
    }
    if !summary.failures_by_kind.is_empty() {
        log::warn!(
            "Failures by kind: {:?}, last: {}",
            summary.failures_by_kind,
            summary.last_failure.as_deref().unwrap_or("-")
        );
    }
    if !summary.fallbacks_by_kind.is_empty() {
        log::info!("Fallbacks by kind: {:?}", summary.fallbacks_by_kind);
    }

    controller.shutdown().await;
    Ok(())
}

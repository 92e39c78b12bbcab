use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::SyntheticProgress;
use crate::audio::WaveformConfig;

const SETTINGS_DIR_NAME: &str = "voicecheck";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const API_URL_ENV: &str = "VOICECHECK_API_URL";
pub const STORAGE_URL_ENV: &str = "VOICECHECK_STORAGE_URL";

/// Which optional paths of the flow are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Open a recording session before capture and analyze on the session route
    pub has_session_affinity: bool,
    /// Upload the finished clip to `storage_url` before analysis
    pub has_remote_storage: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            has_session_affinity: true,
            has_remote_storage: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Analysis service base URL; routes live under `/api/v1`.
    pub api_base_url: String,

    /// "What is my IP" service returning `{ "ip": ... }`.
    pub ip_lookup_url: String,

    pub request_timeout_secs: u64,

    pub countdown_ticks: u32,
    pub countdown_interval_ms: u64,

    /// Slice size for the post-capture chunk walk.
    pub chunk_size_bytes: usize,

    /// Synthetic analysis progress: starts at `progress_start`, adds
    /// `progress_step` every `progress_interval_ms`, stays below `progress_ceiling`.
    pub progress_interval_ms: u64,
    pub progress_start: u8,
    pub progress_step: u8,
    pub progress_ceiling: u8,

    pub waveform_frame_ms: u64,
    pub waveform_width: f32,
    pub waveform_height: f32,

    /// Capture encodings in order of preference (MIME types).
    pub codec_preferences: Vec<String>,

    pub capabilities: Capabilities,

    /// Object storage base URL; required when `has_remote_storage` is on.
    pub storage_url: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            ip_lookup_url: "https://api.ipify.org?format=json".to_string(),
            request_timeout_secs: 60,
            countdown_ticks: 3,
            countdown_interval_ms: 1000,
            chunk_size_bytes: 128 * 1024,
            progress_interval_ms: 50,
            progress_start: 5,
            progress_step: 10,
            progress_ceiling: 90,
            waveform_frame_ms: 16,
            waveform_width: 64.0,
            waveform_height: 8.0,
            codec_preferences: vec![
                "audio/webm".to_string(),
                "audio/mp4".to_string(),
                "audio/wav".to_string(),
            ],
            capabilities: Capabilities::default(),
            storage_url: None,
        }
    }
}

impl AppSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn countdown_interval(&self) -> Duration {
        Duration::from_millis(self.countdown_interval_ms.max(1))
    }

    pub fn synthetic_progress(&self) -> SyntheticProgress {
        SyntheticProgress {
            interval: Duration::from_millis(self.progress_interval_ms.max(1)),
            start: self.progress_start.min(100),
            step: self.progress_step,
            ceiling: self.progress_ceiling.min(100),
        }
    }

    pub fn waveform(&self) -> WaveformConfig {
        WaveformConfig {
            frame_interval: Duration::from_millis(self.waveform_frame_ms.max(1)),
            width: self.waveform_width,
            height: self.waveform_height,
        }
    }

    /// Apply `VOICECHECK_API_URL` / `VOICECHECK_STORAGE_URL` when set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(API_URL_ENV).ok(),
            std::env::var(STORAGE_URL_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, api_url: Option<String>, storage_url: Option<String>) {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            log::info!("Settings: API URL overridden to {}", url);
            self.api_base_url = url;
        }
        if let Some(url) = storage_url.filter(|u| !u.trim().is_empty()) {
            log::info!("Settings: storage URL overridden to {}", url);
            self.storage_url = Some(url);
        }
    }

    /// Remote storage is only usable with a configured URL
    pub fn remote_storage_url(&self) -> Option<&str> {
        if !self.capabilities.has_remote_storage {
            return None;
        }
        let url = self.storage_url.as_deref().filter(|u| !u.trim().is_empty());
        if url.is_none() {
            log::warn!("Settings: remote storage enabled but no storage_url configured");
        }
        url
    }
}

/// Default location: `<config dir>/voicecheck/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: temp file in the same directory, then rename.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json"));
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.chunk_size_bytes, 131072);
        assert!(settings.capabilities.has_session_affinity);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.api_base_url = "https://analyzer.example.test".into();
        settings.capabilities.has_remote_storage = true;
        settings.storage_url = Some("https://bucket.example.test".into());

        save_settings(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"countdown_ticks": 5, "capabilities": {"has_remote_storage": true}}"#)
            .unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.countdown_ticks, 5);
        assert_eq!(settings.api_base_url, "http://localhost:8000");
        assert!(settings.capabilities.has_remote_storage);
        assert!(settings.capabilities.has_session_affinity);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn overrides_ignore_blank_values() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(Some("  ".into()), Some("https://bucket.example.test".into()));
        assert_eq!(settings.api_base_url, "http://localhost:8000");
        assert_eq!(settings.storage_url.as_deref(), Some("https://bucket.example.test"));
    }

    #[test]
    fn remote_storage_requires_capability_and_url() {
        let mut settings = AppSettings::default();
        settings.storage_url = Some("https://bucket.example.test".into());
        assert_eq!(settings.remote_storage_url(), None);

        settings.capabilities.has_remote_storage = true;
        assert_eq!(settings.remote_storage_url(), Some("https://bucket.example.test"));

        settings.storage_url = None;
        assert_eq!(settings.remote_storage_url(), None);
    }

    #[test]
    fn derived_configs_follow_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.synthetic_progress(), SyntheticProgress::default());
        assert_eq!(settings.waveform().frame_interval, Duration::from_millis(16));
        assert_eq!(settings.countdown_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_timer_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"countdown_interval_ms": 0, "progress_interval_ms": 0, "waveform_frame_ms": 0}"#,
        )
        .unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.countdown_interval(), Duration::from_millis(1));
        assert_eq!(settings.synthetic_progress().interval, Duration::from_millis(1));
        assert_eq!(settings.waveform().frame_interval, Duration::from_millis(1));
    }
}

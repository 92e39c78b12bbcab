//! Device permission negotiation
//!
//! Opens a short-lived probe stream to trigger (and verify) microphone
//! access, matches the probe's device against the enumerated inputs, picks
//! an output device, and closes the probe before anything else happens.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;

use crate::error::FlowError;

const DEFAULT_MICROPHONE_LABEL: &str = "Default Microphone";
const DEFAULT_SPEAKER_LABEL: &str = "Default Speaker";

/// Identity of the devices used for one capture cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub input_device_label: String,
    pub output_device_label: String,
    pub codec_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

/// Temporary stream opened only to obtain access and the active device's identity
pub trait ProbeStream {
    fn device_id(&self) -> Option<String>;
    fn close(self: Box<Self>);
}

pub trait DeviceBackend: Send + Sync {
    fn open_probe(&self) -> Result<Box<dyn ProbeStream>, FlowError>;
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, FlowError>;
}

pub struct PermissionNegotiator {
    devices: Arc<dyn DeviceBackend>,
    codec_format: String,
}

impl PermissionNegotiator {
    pub fn new(devices: Arc<dyn DeviceBackend>, codec_format: impl Into<String>) -> Self {
        Self {
            devices,
            codec_format: codec_format.into(),
        }
    }

    /// Acquire device access and resolve device identities.
    ///
    /// Blocking: platform permission prompts may wait on the user.
    pub fn acquire(&self) -> Result<DeviceProfile, FlowError> {
        let probe = self.devices.open_probe()?;
        let probe_id = probe.device_id();
        let listing = self.devices.enumerate();
        probe.close();

        let devices = listing?;
        let probe_id = probe_id.ok_or_else(|| {
            FlowError::DeviceUnavailable("probe stream did not report a device".to_string())
        })?;

        let input = devices
            .iter()
            .find(|d| d.kind == DeviceKind::Input && d.id == probe_id)
            .ok_or_else(|| {
                FlowError::DeviceUnavailable(format!(
                    "active input '{}' not found among devices",
                    probe_id
                ))
            })?;

        let outputs: Vec<&DeviceDescriptor> = devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Output)
            .collect();
        let output = outputs
            .iter()
            .find(|d| d.is_default)
            .or_else(|| outputs.first());

        let profile = DeviceProfile {
            input_device_label: non_empty_or(&input.label, DEFAULT_MICROPHONE_LABEL),
            output_device_label: output
                .map(|d| non_empty_or(&d.label, DEFAULT_SPEAKER_LABEL))
                .unwrap_or_else(|| DEFAULT_SPEAKER_LABEL.to_string()),
            codec_format: self.codec_format.clone(),
        };

        log::info!(
            "Devices: mic={:?} speaker={:?} codec={}",
            profile.input_device_label,
            profile.output_device_label,
            profile.codec_format
        );
        Ok(profile)
    }
}

fn non_empty_or(label: &str, fallback: &str) -> String {
    if label.trim().is_empty() {
        fallback.to_string()
    } else {
        label.to_string()
    }
}

/// Classify a backend error message; platforms report denial only as text
fn classify_backend_error(message: String) -> FlowError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed")
    {
        FlowError::PermissionDenied(message)
    } else {
        FlowError::Unknown(message)
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> FlowError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            FlowError::DeviceUnavailable("input device not available".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_error(err.description),
        other => FlowError::Unknown(other.to_string()),
    }
}

fn map_config_error(err: cpal::DefaultStreamConfigError) -> FlowError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            FlowError::DeviceUnavailable("input device not available".to_string())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_error(err.description)
        }
        other => FlowError::Unknown(other.to_string()),
    }
}

struct CpalProbe {
    _stream: cpal::Stream,
    device_id: Option<String>,
}

impl ProbeStream for CpalProbe {
    fn device_id(&self) -> Option<String> {
        self.device_id.clone()
    }

    fn close(self: Box<Self>) {
        // Dropping the stream releases the device
        log::debug!("Closing probe stream for {:?}", self.device_id);
    }
}

/// Device access through the default CPAL host
pub struct CpalDeviceBackend;

impl DeviceBackend for CpalDeviceBackend {
    fn open_probe(&self) -> Result<Box<dyn ProbeStream>, FlowError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            FlowError::DeviceUnavailable("no audio input device found".to_string())
        })?;

        let supported = device.default_input_config().map_err(map_config_error)?;
        let stream = device
            .build_input_stream_raw(
                &supported.config(),
                supported.sample_format(),
                |_data: &cpal::Data, _: &cpal::InputCallbackInfo| {},
                |err| log::warn!("Probe stream error: {}", err),
                None,
            )
            .map_err(map_build_error)?;
        stream
            .play()
            .map_err(|e| classify_backend_error(e.to_string()))?;

        Ok(Box::new(CpalProbe {
            _stream: stream,
            device_id: device.name().ok(),
        }))
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, FlowError> {
        let host = cpal::default_host();
        let default_output = host.default_output_device().and_then(|d| d.name().ok());
        let default_input = host.default_input_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        let inputs = host
            .input_devices()
            .map_err(|e| FlowError::DeviceUnavailable(e.to_string()))?;
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(DeviceDescriptor {
                    kind: DeviceKind::Input,
                    is_default: default_input.as_deref() == Some(name.as_str()),
                    id: name.clone(),
                    label: name,
                });
            }
        }

        match host.output_devices() {
            Ok(outputs) => {
                for device in outputs {
                    if let Ok(name) = device.name() {
                        devices.push(DeviceDescriptor {
                            kind: DeviceKind::Output,
                            is_default: default_output.as_deref() == Some(name.as_str()),
                            id: name.clone(),
                            label: name,
                        });
                    }
                }
            }
            Err(e) => log::warn!("Could not enumerate output devices: {}", e),
        }

        Ok(devices)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeProbe {
        id: Option<String>,
        closed: Arc<AtomicBool>,
    }

    impl ProbeStream for FakeProbe {
        fn device_id(&self) -> Option<String> {
            self.id.clone()
        }

        fn close(self: Box<Self>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeDevices {
        pub probe: Result<Option<String>, FlowError>,
        pub devices: Result<Vec<DeviceDescriptor>, FlowError>,
        pub closed: Arc<AtomicBool>,
    }

    impl FakeDevices {
        pub(crate) fn granted() -> Self {
            Self {
                probe: Ok(Some("mic-1".into())),
                devices: Ok(vec![
                    input("mic-0", "Webcam Mic"),
                    input("mic-1", "USB Mic"),
                    output("spk-0", "HDMI", false),
                    output("spk-1", "Headphones", true),
                ]),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn denied() -> Self {
            Self {
                probe: Err(FlowError::PermissionDenied("user declined".into())),
                ..Self::granted()
            }
        }
    }

    impl DeviceBackend for FakeDevices {
        fn open_probe(&self) -> Result<Box<dyn ProbeStream>, FlowError> {
            let id = self.probe.clone()?;
            Ok(Box::new(FakeProbe {
                id,
                closed: self.closed.clone(),
            }))
        }

        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, FlowError> {
            self.devices.clone()
        }
    }

    fn input(id: &str, label: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            kind: DeviceKind::Input,
            id: id.into(),
            label: label.into(),
            is_default: false,
        }
    }

    fn output(id: &str, label: &str, is_default: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            kind: DeviceKind::Output,
            id: id.into(),
            label: label.into(),
            is_default,
        }
    }

    #[test]
    fn matches_probe_device_and_default_output() {
        let devices = FakeDevices::granted();
        let closed = devices.closed.clone();
        let negotiator = PermissionNegotiator::new(Arc::new(devices), "audio/wav");

        let profile = negotiator.acquire().unwrap();
        assert_eq!(profile.input_device_label, "USB Mic");
        assert_eq!(profile.output_device_label, "Headphones");
        assert_eq!(profile.codec_format, "audio/wav");
        assert!(closed.load(Ordering::SeqCst), "probe must be closed");
    }

    #[test]
    fn falls_back_to_first_output_then_placeholder() {
        let mut devices = FakeDevices::granted();
        devices.devices = Ok(vec![input("mic-1", ""), output("spk-0", "HDMI", false)]);
        let profile = PermissionNegotiator::new(Arc::new(devices), "audio/wav")
            .acquire()
            .unwrap();
        assert_eq!(profile.input_device_label, "Default Microphone");
        assert_eq!(profile.output_device_label, "HDMI");

        let mut devices = FakeDevices::granted();
        devices.devices = Ok(vec![input("mic-1", "USB Mic")]);
        let profile = PermissionNegotiator::new(Arc::new(devices), "audio/wav")
            .acquire()
            .unwrap();
        assert_eq!(profile.output_device_label, "Default Speaker");
    }

    #[test]
    fn denied_permission_is_reported() {
        let negotiator = PermissionNegotiator::new(Arc::new(FakeDevices::denied()), "audio/wav");
        assert!(matches!(
            negotiator.acquire(),
            Err(FlowError::PermissionDenied(_))
        ));
    }

    #[test]
    fn settings_mismatch_is_device_unavailable_and_probe_is_closed() {
        let mut devices = FakeDevices::granted();
        devices.probe = Ok(Some("mic-9".into()));
        let closed = devices.closed.clone();
        let negotiator = PermissionNegotiator::new(Arc::new(devices), "audio/wav");

        assert!(matches!(
            negotiator.acquire(),
            Err(FlowError::DeviceUnavailable(_))
        ));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn enumeration_failure_still_closes_probe() {
        let mut devices = FakeDevices::granted();
        devices.devices = Err(FlowError::Unknown("enumeration failed".into()));
        let closed = devices.closed.clone();
        let negotiator = PermissionNegotiator::new(Arc::new(devices), "audio/wav");

        assert!(negotiator.acquire().is_err());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn backend_denial_text_maps_to_permission_denied() {
        assert!(matches!(
            classify_backend_error("Permission denied by system".into()),
            FlowError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_error("device busy".into()),
            FlowError::Unknown(_)
        ));
    }
}

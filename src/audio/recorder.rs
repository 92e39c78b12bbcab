//! CPAL capture backend with a streaming WAV encoder
//!
//! The CPAL stream lives on a dedicated audio thread (streams are not `Send`
//! on every platform). The handle talks to that thread over channels: stop
//! drops the stream, which releases the microphone.
//!
//! Every input callback appends one segment of 16-bit PCM to the capture's
//! `SegmentSink`. The first accepted segment carries an open-ended WAV header,
//! so the concatenated segments form a playable file of unknown length.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use hound::{WavSpec, WavWriter};

use super::capture::{CaptureBackend, CaptureStream, SegmentSink};
use super::waveform::{LevelAnalyzer, SharedLevels};
use crate::error::FlowError;

pub const WAV_MIME: &str = "audio/wav";

/// Microphone capture through the default CPAL input device
pub struct CpalCaptureBackend;

impl CaptureBackend for CpalCaptureBackend {
    fn supported_formats(&self) -> Vec<String> {
        vec![WAV_MIME.to_string()]
    }

    fn open(
        &self,
        format: &str,
        segments: SegmentSink,
    ) -> Result<Box<dyn CaptureStream>, FlowError> {
        if !format.eq_ignore_ascii_case(WAV_MIME) {
            return Err(FlowError::EncoderUnavailable(format.to_string()));
        }

        let levels = SharedLevels::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel();

        let thread_levels = levels.clone();
        let thread = std::thread::Builder::new()
            .name("voicecheck-capture".to_string())
            .spawn(move || run_capture_thread(thread_levels, segments, ready_tx, stop_rx))
            .map_err(|e| FlowError::Unknown(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(FlowError::Unknown(
                    "Capture thread exited before the stream started".to_string(),
                ));
            }
        }

        Ok(Box::new(CpalCaptureStream {
            levels,
            stop_tx,
            thread: Some(thread),
        }))
    }
}

struct CpalCaptureStream {
    levels: SharedLevels,
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<Result<(), FlowError>>>,
}

impl CaptureStream for CpalCaptureStream {
    fn analyzer(&self) -> Arc<dyn LevelAnalyzer> {
        Arc::new(self.levels.clone())
    }

    fn finish(mut self: Box<Self>) -> Result<(), FlowError> {
        let _ = self.stop_tx.send(());
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result,
            Err(_) => Err(FlowError::Unknown("Capture thread panicked".to_string())),
        }
    }
}

struct InputDevice {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl InputDevice {
    fn open_default() -> Result<Self, FlowError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            FlowError::DeviceUnavailable("No audio input device found".to_string())
        })?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|e| FlowError::DeviceUnavailable(e.to_string()))?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        Ok(Self {
            sample_format: supported_config.sample_format(),
            config: supported_config.into(),
            device,
        })
    }

    fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.config.channels,
            sample_rate: self.config.sample_rate.0,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }

    fn build_stream(
        &self,
        segments: SegmentSink,
        levels: SharedLevels,
        is_recording: Arc<AtomicBool>,
    ) -> Result<Stream, FlowError> {
        let header = streaming_wav_header(self.wav_spec())?;
        match self.sample_format {
            SampleFormat::I16 => {
                self.build_stream_typed::<i16>(header, segments, levels, is_recording)
            }
            SampleFormat::U16 => {
                self.build_stream_typed::<u16>(header, segments, levels, is_recording)
            }
            SampleFormat::F32 => {
                self.build_stream_typed::<f32>(header, segments, levels, is_recording)
            }
            other => Err(FlowError::EncoderUnavailable(format!(
                "unsupported sample format {:?}",
                other
            ))),
        }
    }

    fn build_stream_typed<T>(
        &self,
        header: Vec<u8>,
        segments: SegmentSink,
        levels: SharedLevels,
        is_recording: Arc<AtomicBool>,
    ) -> Result<Stream, FlowError>
    where
        T: cpal::Sample + cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        // Held back until the capture accepts its first segment
        let mut pending_header = Some(header);

        self.device
            .build_input_stream(
                &self.config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !is_recording.load(Ordering::SeqCst) {
                        return;
                    }

                    let floats: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                    levels.push_samples(&floats);

                    let mut segment = pending_header.clone().unwrap_or_default();
                    for &f in &floats {
                        segment.extend_from_slice(&f32_to_i16(f).to_le_bytes());
                    }
                    // Rejected while the session is still arming
                    if segments.append(segment).is_ok() {
                        pending_header = None;
                    }
                },
                |err| log::error!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| FlowError::Unknown(format!("Failed to create audio stream: {}", e)))
    }
}

fn run_capture_thread(
    levels: SharedLevels,
    segments: SegmentSink,
    ready_tx: SyncSender<Result<(), FlowError>>,
    stop_rx: Receiver<()>,
) -> Result<(), FlowError> {
    let input = match InputDevice::open_default() {
        Ok(input) => input,
        Err(e) => {
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    let is_recording = Arc::new(AtomicBool::new(true));

    let stream = match input
        .build_stream(segments, levels, is_recording.clone())
        .and_then(|stream| {
            stream
                .play()
                .map_err(|e| FlowError::Unknown(format!("Failed to start stream: {}", e)))?;
            Ok(stream)
        }) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    let _ = ready_tx.send(Ok(()));
    log::info!("Recording started");

    // Blocks until stop is requested or the handle is dropped
    let _ = stop_rx.recv();

    is_recording.store(false, Ordering::SeqCst);
    drop(stream);
    log::info!("Recording stopped, microphone released");
    Ok(())
}

/// WAV header for 16-bit PCM of unknown length.
///
/// The RIFF and data sizes are left at their maximum (the data size rounded
/// down to whole frames), which decoders read as "until end of file".
pub fn streaming_wav_header(spec: WavSpec) -> Result<Vec<u8>, FlowError> {
    let mut cursor = Cursor::new(Vec::new());
    WavWriter::new(&mut cursor, spec)
        .and_then(|writer| writer.finalize())
        .map_err(|e| FlowError::Unknown(format!("Failed to create WAV header: {}", e)))?;
    let mut header = cursor.into_inner();

    let data = header
        .windows(4)
        .rposition(|w| w == b"data")
        .ok_or_else(|| FlowError::Unknown("WAV header has no data chunk".to_string()))?;
    let frame_len = u32::from(spec.channels) * u32::from(spec.bits_per_sample / 8);
    let data_len = u32::MAX - u32::MAX % frame_len.max(1);

    header[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
    header[data + 4..data + 8].copy_from_slice(&data_len.to_le_bytes());
    Ok(header)
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);

        // Clamping
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }

    fn pcm16(channels: u16) -> WavSpec {
        WavSpec {
            channels,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }

    #[test]
    fn header_then_pcm_segments_decode_as_wav() {
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX];

        // Same layout the input callback produces: header on the first segment
        let mut first = streaming_wav_header(pcm16(1)).unwrap();
        first.extend(samples[..2].iter().flat_map(|s| s.to_le_bytes()));
        let second: Vec<u8> = samples[2..].iter().flat_map(|s| s.to_le_bytes()).collect();
        let wav = [first, second].concat();
        assert_eq!(&wav[0..4], b"RIFF");

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        let decoded: Vec<i16> = reader
            .samples::<i16>()
            .take(samples.len())
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn open_ended_data_size_is_whole_frames() {
        let header = streaming_wav_header(pcm16(2)).unwrap();
        let data = header.windows(4).rposition(|w| w == b"data").unwrap();
        assert_eq!(header.len(), data + 8);

        let size = u32::from_le_bytes(header[data + 4..data + 8].try_into().unwrap());
        assert_eq!(size % 4, 0);
        assert!(size > u32::MAX - 4);
    }

    #[test]
    fn only_wav_is_advertised() {
        assert_eq!(CpalCaptureBackend.supported_formats(), vec!["audio/wav"]);
    }
}

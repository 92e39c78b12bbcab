//! Live waveform rendering while a capture is active
//!
//! A cooperative loop that wakes once per display refresh, reads the current
//! time-domain samples from the capture's analyzer, turns them into an
//! amplitude polyline, and hands the frame to a `WaveformSink`. Read failures
//! skip the frame; the loop only ends when its stop signal fires.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Samples kept for the live view (matches a 2048-point analyser window)
const LEVEL_WINDOW: usize = 2048;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// ~60fps, one frame per display refresh
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

const SPARK_CHARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

#[derive(Debug, Clone, thiserror::Error)]
#[error("analyzer read failed: {0}")]
pub struct AnalyzerError(pub String);

/// Live source of time-domain samples in the range -1.0..=1.0
pub trait LevelAnalyzer: Send + Sync {
    fn time_domain(&self) -> Result<Vec<f32>, AnalyzerError>;
}

/// One rendered frame: polyline points plus a smoothed overall level (0.0-1.0)
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformFrame {
    pub points: Vec<(f32, f32)>,
    pub width: f32,
    pub height: f32,
    pub level: f32,
}

pub trait WaveformSink: Send + Sync {
    fn draw(&self, frame: &WaveformFrame);
}

#[derive(Debug, Clone, Copy)]
pub struct WaveformConfig {
    pub frame_interval: Duration,
    pub width: f32,
    pub height: f32,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            frame_interval: DEFAULT_FRAME_INTERVAL,
            width: 64.0,
            height: 8.0,
        }
    }
}

/// Map samples onto a `width` x `height` surface.
///
/// Sample index drives the horizontal position; amplitude is shifted into
/// 0.0..=2.0 and scaled so silence sits on the horizontal midline. The trace
/// always ends on the midline at the right edge.
pub fn trace_polyline(samples: &[f32], width: f32, height: f32) -> Vec<(f32, f32)> {
    let mut points = Vec::with_capacity(samples.len() + 1);
    if !samples.is_empty() {
        let slice_width = width / samples.len() as f32;
        for (i, &sample) in samples.iter().enumerate() {
            let v = sample.clamp(-1.0, 1.0) + 1.0;
            points.push((i as f32 * slice_width, v * height / 2.0));
        }
    }
    points.push((width, height / 2.0));
    points
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_squares / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}

/// Ring buffer of the most recent samples, written by the capture callback
pub struct LevelBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl LevelBuffer {
    pub fn new() -> Self {
        Self::with_capacity(LEVEL_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add samples, dropping the oldest ones once at capacity
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }
        self.samples.extend(samples);
    }

    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LevelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// `LevelBuffer` shared between an audio callback and the renderer
#[derive(Clone, Default)]
pub struct SharedLevels {
    inner: Arc<Mutex<LevelBuffer>>,
}

impl SharedLevels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_samples(&self, samples: &[f32]) {
        if let Ok(mut buffer) = self.inner.lock() {
            buffer.push_samples(samples);
        }
    }
}

impl LevelAnalyzer for SharedLevels {
    fn time_domain(&self) -> Result<Vec<f32>, AnalyzerError> {
        self.inner
            .lock()
            .map(|buffer| buffer.snapshot())
            .map_err(|e| AnalyzerError(e.to_string()))
    }
}

struct EmaState {
    prev: f32,
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev: 0.0,
            initialized: false,
        }
    }

    fn apply(&mut self, value: f32) -> f32 {
        if !self.initialized {
            self.prev = value;
            self.initialized = true;
            return value;
        }
        self.prev = EMA_ALPHA * value + (1.0 - EMA_ALPHA) * self.prev;
        self.prev
    }
}

/// Discards every frame (headless runs, tests)
pub struct NullWaveformSink;

impl WaveformSink for NullWaveformSink {
    fn draw(&self, _frame: &WaveformFrame) {}
}

/// Draws the trace as a one-line sparkline on stderr
pub struct TerminalWaveform {
    columns: usize,
}

impl TerminalWaveform {
    pub fn new(columns: usize) -> Self {
        Self {
            columns: columns.max(1),
        }
    }

    fn sparkline(&self, frame: &WaveformFrame) -> String {
        let mid = frame.height / 2.0;
        if frame.points.is_empty() || mid <= 0.0 {
            return " ".repeat(self.columns);
        }
        let per_column = (frame.points.len() / self.columns).max(1);
        frame
            .points
            .chunks(per_column)
            .take(self.columns)
            .map(|column| {
                let peak = column
                    .iter()
                    .map(|&(_, y)| (y - mid).abs() / mid)
                    .fold(0.0f32, f32::max)
                    .clamp(0.0, 1.0);
                let idx = (peak * (SPARK_CHARS.len() - 1) as f32).round() as usize;
                SPARK_CHARS[idx]
            })
            .collect()
    }
}

impl WaveformSink for TerminalWaveform {
    fn draw(&self, frame: &WaveformFrame) {
        let line = self.sparkline(frame);
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{} {:>3.0}%", line, frame.level * 100.0);
        let _ = err.flush();
    }
}

/// Handle to a running renderer loop
pub struct RendererHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RendererHandle {
    /// Signal the loop to end; the stop branch is polled ahead of the frame timer.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        drop(self.task);
    }
}

/// Spawn the renderer on the current Tokio runtime
pub fn spawn_renderer(
    analyzer: Arc<dyn LevelAnalyzer>,
    sink: Arc<dyn WaveformSink>,
    config: WaveformConfig,
) -> RendererHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run_waveform_renderer(analyzer, sink, config, stop_rx));
    RendererHandle { stop_tx, task }
}

pub async fn run_waveform_renderer(
    analyzer: Arc<dyn LevelAnalyzer>,
    sink: Arc<dyn WaveformSink>,
    config: WaveformConfig,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ema = EmaState::new();
    let mut tick = interval(config.frame_interval);

    log::debug!("Waveform renderer started");

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                log::debug!("Waveform renderer received stop signal");
                break;
            }
            _ = tick.tick() => {
                let samples = match analyzer.time_domain() {
                    Ok(samples) => samples,
                    Err(e) => {
                        log::trace!("Skipping waveform frame: {}", e);
                        continue;
                    }
                };

                let frame = WaveformFrame {
                    points: trace_polyline(&samples, config.width, config.height),
                    width: config.width,
                    height: config.height,
                    level: ema.apply(rms(&samples)),
                };
                sink.draw(&frame);
            }
        }
    }

    log::debug!("Waveform renderer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        frames: AtomicUsize,
        last: Mutex<Option<WaveformFrame>>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                frames: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }
    }

    impl WaveformSink for CountingSink {
        fn draw(&self, frame: &WaveformFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(frame.clone());
        }
    }

    /// Fails on every other read
    struct FlakyAnalyzer {
        reads: AtomicUsize,
    }

    impl LevelAnalyzer for FlakyAnalyzer {
        fn time_domain(&self) -> Result<Vec<f32>, AnalyzerError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 1 {
                Err(AnalyzerError("device busy".into()))
            } else {
                Ok(vec![0.5, -0.5, 0.0])
            }
        }
    }

    #[test]
    fn silence_traces_the_midline() {
        let points = trace_polyline(&[0.0; 4], 100.0, 50.0);
        assert_eq!(points.len(), 5);
        for &(_, y) in &points {
            assert_eq!(y, 25.0);
        }
        assert_eq!(points[1].0, 25.0);
        assert_eq!(*points.last().unwrap(), (100.0, 25.0));
    }

    #[test]
    fn full_scale_samples_hit_the_edges() {
        let points = trace_polyline(&[1.0, -1.0, 3.0], 30.0, 10.0);
        assert_eq!(points[0], (0.0, 10.0));
        assert_eq!(points[1], (10.0, 0.0));
        // Out-of-range input is clamped
        assert_eq!(points[2], (20.0, 10.0));
    }

    #[test]
    fn empty_samples_still_end_on_midline() {
        assert_eq!(trace_polyline(&[], 10.0, 4.0), vec![(10.0, 2.0)]);
    }

    #[test]
    fn level_buffer_is_bounded() {
        let mut buffer = LevelBuffer::with_capacity(100);
        buffer.push_samples(&vec![0.1; 150]);
        assert_eq!(buffer.len(), 100);

        buffer.push_samples(&[0.9; 10]);
        assert_eq!(buffer.len(), 100);
        assert_eq!(*buffer.snapshot().last().unwrap(), 0.9);
    }

    #[test]
    fn ema_smooths_level() {
        let mut ema = EmaState::new();
        assert_eq!(ema.apply(0.5), 0.5);
        let expected = EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * 0.5;
        assert!((ema.apply(1.0) - expected).abs() < 0.001);
    }

    #[test]
    fn sparkline_has_requested_width() {
        let sink = TerminalWaveform::new(8);
        let frame = WaveformFrame {
            points: trace_polyline(&[0.0; 64], 64.0, 8.0),
            width: 64.0,
            height: 8.0,
            level: 0.0,
        };
        let line = sink.sparkline(&frame);
        assert_eq!(line.chars().count(), 8);
        assert!(line.chars().all(|c| c == '▁'));
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_skips_failed_reads_and_stops_on_signal() {
        let analyzer = Arc::new(FlakyAnalyzer {
            reads: AtomicUsize::new(0),
        });
        let sink = Arc::new(CountingSink::new());
        let config = WaveformConfig {
            frame_interval: Duration::from_millis(10),
            ..WaveformConfig::default()
        };

        let handle = spawn_renderer(analyzer.clone(), sink.clone(), config);
        tokio::time::sleep(Duration::from_millis(95)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reads = analyzer.reads.load(Ordering::SeqCst);
        let frames = sink.frames.load(Ordering::SeqCst);
        assert_eq!(reads, 10);
        assert_eq!(frames, 5);

        let last = sink.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.points.len(), 4);
        assert!(last.level > 0.0);
    }
}

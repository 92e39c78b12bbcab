//! Analysis submission with synthetic progress
//!
//! The multipart request exposes no byte-level progress, so while it is in
//! flight the analysis stage advances on a timer from `start` in `step`
//! increments, staying below `ceiling` until the response settles. The
//! timer runs in the same task as the request and stops the moment the
//! request resolves, so no tick can land after the final value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};

use super::client::{AnalysisApi, AnalysisResult, AnalysisRoute};
use super::session::RecordingSession;
use crate::audio::AudioBlob;
use crate::error::FlowError;
use crate::progress::{ProgressSink, ProgressStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticProgress {
    pub interval: Duration,
    pub start: u8,
    pub step: u8,
    pub ceiling: u8,
}

impl Default for SyntheticProgress {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            start: 5,
            step: 10,
            ceiling: 90,
        }
    }
}

/// File name reported to the analysis service for a clip finished at `at`
pub fn analysis_file_name(at: DateTime<Utc>) -> String {
    at.format("input_%Y-%m-%d_%H-%M-%S-%3f").to_string()
}

pub struct AnalysisDispatcher {
    api: Arc<dyn AnalysisApi>,
    synthetic: SyntheticProgress,
}

impl AnalysisDispatcher {
    pub fn new(api: Arc<dyn AnalysisApi>, synthetic: SyntheticProgress) -> Self {
        Self { api, synthetic }
    }

    /// Submit a finished clip. The route is chosen here, once, from `session`.
    pub async fn submit(
        &self,
        blob: &AudioBlob,
        file_name: &str,
        session: &RecordingSession,
        progress: &dyn ProgressSink,
    ) -> Result<AnalysisResult, FlowError> {
        let route = AnalysisRoute::for_session(session);
        log::info!(
            "Submitting {} for analysis via {} route",
            file_name,
            if route.is_session() { "session" } else { "legacy" }
        );

        let mut current = self.synthetic.start;
        progress.set(ProgressStage::Analysis, current, false);

        let request = self.api.analyze(&route, blob, file_name);
        tokio::pin!(request);

        let mut ticker = interval(self.synthetic.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut request => break outcome,
                _ = ticker.tick() => {
                    let next = current.saturating_add(self.synthetic.step);
                    if next < self.synthetic.ceiling {
                        current = next;
                        progress.set(ProgressStage::Analysis, current, false);
                    }
                }
            }
        };

        match outcome {
            Ok(result) => {
                progress.set(ProgressStage::Analysis, 100, false);
                Ok(result)
            }
            Err(e) => {
                log::error!("Analysis failed: {}", e);
                progress.set(ProgressStage::Analysis, 100, true);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(u8, bool)>>);

    impl ProgressSink for Recorded {
        fn set(&self, stage: ProgressStage, percent: u8, errored: bool) {
            assert_eq!(stage, ProgressStage::Analysis);
            self.0.lock().unwrap().push((percent, errored));
        }
    }

    struct SlowApi {
        delay: Duration,
        fail: bool,
        routes: Mutex<Vec<AnalysisRoute>>,
    }

    impl SlowApi {
        fn new(delay: Duration, fail: bool) -> Self {
            Self {
                delay,
                fail,
                routes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnalysisApi for SlowApi {
        async fn analyze(
            &self,
            route: &AnalysisRoute,
            _blob: &AudioBlob,
            _file_name: &str,
        ) -> Result<AnalysisResult, FlowError> {
            self.routes.lock().unwrap().push(route.clone());
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(FlowError::AnalysisFailed {
                    status: Some(400),
                    detail: Some("Audio too short".into()),
                });
            }
            Ok(AnalysisResult {
                quality_score: 3.5,
                signal_to_noise_db: 25.0,
                sample_rate_hz: 48000,
                quality_category: "Good".into(),
            })
        }
    }

    fn blob() -> AudioBlob {
        AudioBlob::new(vec![0u8; 64], "audio/wav")
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_progress_stays_below_ceiling_then_completes() {
        let api = Arc::new(SlowApi::new(Duration::from_millis(500), false));
        let dispatcher = AnalysisDispatcher::new(api, SyntheticProgress::default());
        let progress = Recorded::default();

        let result = dispatcher
            .submit(&blob(), "input_x", &RecordingSession::absent(), &progress)
            .await
            .unwrap();
        assert_eq!(result.quality_category, "Good");

        let values: Vec<u8> = progress.0.lock().unwrap().iter().map(|(p, _)| *p).collect();
        assert_eq!(values, vec![5, 15, 25, 35, 45, 55, 65, 75, 85, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_ends_at_100_errored() {
        let api = Arc::new(SlowApi::new(Duration::from_millis(120), true));
        let dispatcher = AnalysisDispatcher::new(api, SyntheticProgress::default());
        let progress = Recorded::default();

        let err = dispatcher
            .submit(&blob(), "input_x", &RecordingSession::with_id("s"), &progress)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "API response: 400 | Audio too short");
        assert_eq!(progress.0.lock().unwrap().last(), Some(&(100, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn route_depends_only_on_the_session_given() {
        let api = Arc::new(SlowApi::new(Duration::from_millis(10), false));
        let dispatcher = AnalysisDispatcher::new(api.clone(), SyntheticProgress::default());
        let progress = Recorded::default();

        for session in [
            RecordingSession::with_id("a"),
            RecordingSession::absent(),
            RecordingSession::with_id("b"),
            RecordingSession::absent(),
        ] {
            dispatcher
                .submit(&blob(), "input_x", &session, &progress)
                .await
                .unwrap();
        }

        assert_eq!(
            *api.routes.lock().unwrap(),
            vec![
                AnalysisRoute::Session("a".into()),
                AnalysisRoute::Legacy,
                AnalysisRoute::Session("b".into()),
                AnalysisRoute::Legacy,
            ]
        );
    }

    #[test]
    fn file_name_uses_dashed_iso_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(analysis_file_name(at), "input_2024-03-09_14-05-07-042");
    }
}

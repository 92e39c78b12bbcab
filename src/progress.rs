//! Progress reporting for the upload and analysis stages
//!
//! `ProgressReporter` keeps only the last value per stage and publishes it on
//! a watch channel for whatever front end is attached. It never smooths or
//! aggregates; callers own the shape of the sequence they emit.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressStage {
    Upload,
    Analysis,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Upload => "upload",
            ProgressStage::Analysis => "analysis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub stage: ProgressStage,
    pub percent: u8,
    pub errored: bool,
}

impl ProgressState {
    pub fn start(stage: ProgressStage) -> Self {
        Self {
            stage,
            percent: 0,
            errored: false,
        }
    }
}

/// Destination for progress values.
pub trait ProgressSink: Send + Sync {
    fn set(&self, stage: ProgressStage, percent: u8, errored: bool);
}

pub struct ProgressReporter {
    upload: watch::Sender<ProgressState>,
    analysis: watch::Sender<ProgressState>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (upload, _) = watch::channel(ProgressState::start(ProgressStage::Upload));
        let (analysis, _) = watch::channel(ProgressState::start(ProgressStage::Analysis));
        Self { upload, analysis }
    }

    fn channel(&self, stage: ProgressStage) -> &watch::Sender<ProgressState> {
        match stage {
            ProgressStage::Upload => &self.upload,
            ProgressStage::Analysis => &self.analysis,
        }
    }

    /// Reset a stage to 0% at the start of a cycle step
    pub fn reset(&self, stage: ProgressStage) {
        self.channel(stage).send_replace(ProgressState::start(stage));
    }

    pub fn last(&self, stage: ProgressStage) -> ProgressState {
        *self.channel(stage).borrow()
    }

    pub fn subscribe(&self, stage: ProgressStage) -> watch::Receiver<ProgressState> {
        self.channel(stage).subscribe()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressReporter {
    fn set(&self, stage: ProgressStage, percent: u8, errored: bool) {
        let percent = percent.min(100);
        log::trace!("Progress {}: {}% (errored={})", stage.as_str(), percent, errored);
        self.channel(stage).send_replace(ProgressState {
            stage,
            percent,
            errored,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_tracked_independently() {
        let reporter = ProgressReporter::new();
        reporter.set(ProgressStage::Upload, 40, false);
        reporter.set(ProgressStage::Analysis, 100, true);

        assert_eq!(reporter.last(ProgressStage::Upload).percent, 40);
        assert!(!reporter.last(ProgressStage::Upload).errored);

        let analysis = reporter.last(ProgressStage::Analysis);
        assert_eq!(analysis.percent, 100);
        assert!(analysis.errored);
    }

    #[test]
    fn percent_is_clamped() {
        let reporter = ProgressReporter::new();
        reporter.set(ProgressStage::Upload, 250, false);
        assert_eq!(reporter.last(ProgressStage::Upload).percent, 100);
    }

    #[test]
    fn reset_clears_error_flag() {
        let reporter = ProgressReporter::new();
        reporter.set(ProgressStage::Analysis, 100, true);
        reporter.reset(ProgressStage::Analysis);
        assert_eq!(
            reporter.last(ProgressStage::Analysis),
            ProgressState::start(ProgressStage::Analysis)
        );
    }

    #[test]
    fn subscribers_see_latest_value() {
        let reporter = ProgressReporter::new();
        let rx = reporter.subscribe(ProgressStage::Upload);
        reporter.set(ProgressStage::Upload, 75, false);
        assert_eq!(rx.borrow().percent, 75);
    }
}

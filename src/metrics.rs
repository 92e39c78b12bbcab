//! Per-cycle metrics for the record-and-analyze flow
//!
//! Every cycle that reaches an outcome (a score or a fatal error) leaves one
//! `CycleRecord`. Cancelled cycles leave nothing. Non-fatal errors (session
//! fallback, storage upload) are noted on the cycle they happened in.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::FlowError;

/// Records kept for the summary (newest first)
const MAX_RECORDS: usize = 50;

/// Which analysis endpoint a cycle used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteUsed {
    Session,
    Legacy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Scored(f64),
    Failed {
        kind: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub recording: Option<Duration>,
    pub clip_size_bytes: u64,
    pub analysis: Option<Duration>,
    pub route: Option<RouteUsed>,
    /// Kinds of the non-fatal errors seen during the cycle
    pub fallbacks: Vec<&'static str>,
    pub outcome: CycleOutcome,
    pub total: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub total_cycles: usize,
    pub scored_cycles: usize,
    pub failed_cycles: usize,
    pub session_routed: usize,
    pub avg_analysis_ms: u64,
    pub avg_quality_score: Option<f64>,
    pub failures_by_kind: BTreeMap<&'static str, usize>,
    pub fallbacks_by_kind: BTreeMap<&'static str, usize>,
    pub last_failure: Option<String>,
}

struct ActiveCycle {
    cycle_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    recording_started: Option<Instant>,
    recording: Option<Duration>,
    clip_size_bytes: u64,
    analysis_started: Option<Instant>,
    route: Option<RouteUsed>,
    fallbacks: Vec<&'static str>,
}

impl ActiveCycle {
    fn finish(self, outcome: CycleOutcome) -> CycleRecord {
        CycleRecord {
            cycle_id: self.cycle_id,
            started_at: self.started_at,
            recording: self.recording,
            clip_size_bytes: self.clip_size_bytes,
            analysis: self.analysis_started.map(|t| t.elapsed()),
            route: self.route,
            fallbacks: self.fallbacks,
            outcome,
            total: self.started.elapsed(),
        }
    }
}

#[derive(Default)]
pub struct MetricsCollector {
    active: Option<ActiveCycle>,
    records: VecDeque<CycleRecord>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new cycle replaces one that never reached an outcome (cancelled early)
    pub fn start_cycle(&mut self, cycle_id: Uuid) {
        if let Some(previous) = self.active.take() {
            log::debug!("Metrics: dropping unfinished cycle {}", previous.cycle_id);
        }
        self.active = Some(ActiveCycle {
            cycle_id,
            started_at: Utc::now(),
            started: Instant::now(),
            recording_started: None,
            recording: None,
            clip_size_bytes: 0,
            analysis_started: None,
            route: None,
            fallbacks: Vec::new(),
        });
    }

    pub fn recording_started(&mut self) {
        if let Some(cycle) = self.active.as_mut() {
            cycle.recording_started = Some(Instant::now());
        }
    }

    pub fn recording_stopped(&mut self, clip_size_bytes: u64) {
        if let Some(cycle) = self.active.as_mut() {
            cycle.recording = cycle.recording_started.map(|t| t.elapsed());
            cycle.clip_size_bytes = clip_size_bytes;
            log::info!(
                "Metrics: cycle {} recorded {} bytes in {:?}",
                cycle.cycle_id,
                clip_size_bytes,
                cycle.recording
            );
        }
    }

    pub fn analysis_started(&mut self, route: RouteUsed) {
        if let Some(cycle) = self.active.as_mut() {
            cycle.analysis_started = Some(Instant::now());
            cycle.route = Some(route);
        }
    }

    pub fn cycle_scored(&mut self, quality_score: f64) {
        if let Some(cycle) = self.active.take() {
            let record = cycle.finish(CycleOutcome::Scored(quality_score));
            log::info!(
                "Metrics: cycle {} scored {:.2} via {:?} - analysis {:?}, total {:?}",
                record.cycle_id,
                quality_score,
                record.route,
                record.analysis,
                record.total
            );
            self.push(record);
        }
    }

    /// Fatal errors close the active cycle; non-fatal ones are noted on it
    pub fn record_failure(&mut self, error: &FlowError) {
        let Some(cycle) = self.active.as_mut() else {
            log::debug!("Metrics: {} outside a cycle", error.kind());
            return;
        };

        if !error.is_fatal() {
            cycle.fallbacks.push(error.kind());
            return;
        }

        if let Some(cycle) = self.active.take() {
            let record = cycle.finish(CycleOutcome::Failed {
                kind: error.kind(),
                message: error.to_string(),
            });
            log::warn!(
                "Metrics: cycle {} failed after {:?} - {}",
                record.cycle_id,
                record.total,
                error
            );
            self.push(record);
        }
    }

    /// Forget the cycle if it is still the active one
    pub fn cycle_cancelled(&mut self, cycle_id: Uuid) {
        if self.active.as_ref().map(|c| c.cycle_id) == Some(cycle_id) {
            self.active = None;
            log::debug!("Metrics: cycle {} cancelled", cycle_id);
        }
    }

    fn push(&mut self, record: CycleRecord) {
        self.records.push_front(record);
        self.records.truncate(MAX_RECORDS);
    }

    pub fn summary(&self) -> MetricsSummary {
        let mut failures_by_kind = BTreeMap::new();
        let mut fallbacks_by_kind = BTreeMap::new();
        let mut scores = Vec::new();
        let mut analysis_ms = Vec::new();

        for record in &self.records {
            for kind in &record.fallbacks {
                *fallbacks_by_kind.entry(*kind).or_insert(0) += 1;
            }
            match &record.outcome {
                CycleOutcome::Scored(score) => {
                    scores.push(*score);
                    if let Some(analysis) = record.analysis {
                        analysis_ms.push(analysis.as_millis() as u64);
                    }
                }
                CycleOutcome::Failed { kind, .. } => {
                    *failures_by_kind.entry(*kind).or_insert(0) += 1;
                }
            }
        }

        let last_failure = self.records.iter().find_map(|r| match &r.outcome {
            CycleOutcome::Failed { message, .. } => Some(message.clone()),
            CycleOutcome::Scored(_) => None,
        });

        MetricsSummary {
            total_cycles: self.records.len(),
            scored_cycles: scores.len(),
            failed_cycles: self.records.len() - scores.len(),
            session_routed: self
                .records
                .iter()
                .filter(|r| r.route == Some(RouteUsed::Session))
                .count(),
            avg_analysis_ms: if analysis_ms.is_empty() {
                0
            } else {
                analysis_ms.iter().sum::<u64>() / analysis_ms.len() as u64
            },
            avg_quality_score: if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            },
            failures_by_kind,
            fallbacks_by_kind,
            last_failure,
        }
    }
}

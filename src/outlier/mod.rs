//! Classification of completed calls as normal or anomalous.
//!
//! [`OutlierDetector`] drives one rank's per-frame statistics cycle: fold the
//! frame's runtimes into local [`RunStats`], push them to the aggregator,
//! classify against the merged view and report the anomaly counts back.

pub mod lof;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Algorithm, DetectorConfig, LocalScope, PushFailurePolicy};
use crate::ps::StatsAggregator;
use crate::stats::RunStats;

use self::lof::Lof;

/// Per-call classification, serialized as `1` (normal) or `-1` (anomalous).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Label {
    #[default]
    Normal,
    Anomalous,
}

impl From<Label> for i8 {
    fn from(label: Label) -> Self {
        match label {
            Label::Normal => 1,
            Label::Anomalous => -1,
        }
    }
}

#[derive(Error, Debug)]
#[error("invalid label {0}, expected 1 or -1")]
pub struct InvalidLabel(i8);

impl TryFrom<i8> for Label {
    type Error = InvalidLabel;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Normal),
            -1 => Ok(Self::Anomalous),
            other => Err(InvalidLabel(other)),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i8::from(*self))
    }
}

/// One completed call as seen by a classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub entry: f64,
    pub runtime: f64,
}

impl Sample {
    pub const fn new(entry: f64, runtime: f64) -> Self {
        Self { entry, runtime }
    }
}

/// Flags runtimes above `mean + sigma * stddev`.
#[derive(Debug, Clone, Copy)]
pub struct SigmaThreshold {
    pub sigma: f64,
    /// Statistics must hold strictly more samples than this.
    pub min_samples: u64,
}

impl SigmaThreshold {
    /// Decision boundary for `stats`, or `None` while there are too few samples.
    pub fn threshold(&self, stats: &RunStats) -> Option<f64> {
        let (n, _) = stats.count();
        if n <= self.min_samples {
            return None;
        }
        Some(stats.mean() + self.sigma * stats.stddev())
    }

    pub fn classify(&self, samples: &[Sample], stats: &RunStats) -> Vec<Label> {
        match self.threshold(stats) {
            Some(limit) => samples
                .iter()
                .map(|s| {
                    if s.runtime > limit {
                        Label::Anomalous
                    } else {
                        Label::Normal
                    }
                })
                .collect(),
            None => vec![Label::Normal; samples.len()],
        }
    }
}

/// Interchangeable classification strategies.
#[derive(Debug, Clone)]
pub enum Detector {
    Streaming(SigmaThreshold),
    /// Density based; ignores the running statistics.
    Batch(Lof),
}

impl Detector {
    pub fn from_config(cfg: &DetectorConfig) -> Self {
        match cfg.algorithm {
            Algorithm::Streaming => Self::Streaming(SigmaThreshold {
                sigma: cfg.sigma,
                min_samples: cfg.min_samples,
            }),
            Algorithm::Batch => Self::Batch(Lof::new(&cfg.lof)),
        }
    }

    pub fn classify(&self, samples: &[Sample], stats: &RunStats) -> Vec<Label> {
        match self {
            Self::Streaming(t) => t.classify(samples, stats),
            Self::Batch(lof) => lof.classify(samples),
        }
    }

    fn needs_stats(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

/// Per-rank statistics and classification state.
pub struct OutlierDetector {
    config: DetectorConfig,
    detector: Detector,
    /// Local view, frame- or rank-scoped.
    local: HashMap<u64, RunStats>,
    /// Samples folded in since the last push.
    unpushed: HashMap<u64, RunStats>,
    /// Merged statistics returned by the last successful push.
    global: HashMap<u64, RunStats>,
    /// Anomalies labelled during the current frame.
    abnormal: HashMap<u64, u64>,
    push_failed: bool,
}

impl OutlierDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let detector = Detector::from_config(&config);
        Self {
            config,
            detector,
            local: HashMap::new(),
            unpushed: HashMap::new(),
            global: HashMap::new(),
            abnormal: HashMap::new(),
            push_failed: false,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Prepares for a new frame.
    pub fn init_local_stat(&mut self) {
        if self.config.local_scope == LocalScope::Frame {
            self.local.clear();
        }
        self.unpushed.clear();
        self.global.clear();
        self.abnormal.clear();
        self.push_failed = false;
    }

    /// Folds the runtimes of `samples` into the local statistics of `func_id`.
    pub fn add_local_stat(&mut self, samples: &[Sample], func_id: u64) {
        if samples.is_empty() {
            return;
        }
        let local = self.local.entry(func_id).or_default();
        let delta = self.unpushed.entry(func_id).or_default();
        for s in samples {
            local.push(s.runtime);
            delta.push(s.runtime);
        }
    }

    /// Sends the statistics gathered since the last push to the aggregator.
    ///
    /// Returns whether merged global statistics are now available for
    /// classification. A transport failure is logged and the frame falls
    /// back according to `on_push_failure`; the unsent delta is dropped
    /// since the local view already contains it.
    pub async fn push_local_stat<A: StatsAggregator>(&mut self, aggregator: Option<&A>) -> bool {
        let Some(aggregator) = aggregator else {
            return false;
        };
        if self.unpushed.is_empty() {
            return false;
        }

        let delta = std::mem::take(&mut self.unpushed);
        let functions = delta.len();
        match aggregator.update_all(delta).await {
            Ok(merged) => {
                debug!(functions, "pushed local statistics");
                if self.config.pull_global {
                    self.global = merged;
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    functions,
                    fallback = ?self.config.on_push_failure,
                    "statistics push failed"
                );
                self.push_failed = true;
                false
            }
        }
    }

    /// Statistics `func_id` is classified against this frame.
    pub fn stats_for(&self, func_id: u64) -> Option<RunStats> {
        if let Some(global) = self.global.get(&func_id) {
            return Some(*global);
        }
        if self.push_failed && self.config.on_push_failure == PushFailurePolicy::Normal {
            return None;
        }
        self.local.get(&func_id).copied()
    }

    /// Labels `samples` of `func_id` and records the anomaly count.
    pub fn comp_outlier(&mut self, samples: &[Sample], func_id: u64) -> Vec<Label> {
        let labels = match self.stats_for(func_id) {
            Some(stats) => self.detector.classify(samples, &stats),
            None if self.detector.needs_stats() => vec![Label::Normal; samples.len()],
            None => self.detector.classify(samples, &RunStats::new()),
        };

        let n = labels.iter().filter(|l| **l == Label::Anomalous).count() as u64;
        if n > 0 {
            self.add_abnormal(func_id, n);
        }
        labels
    }

    /// Records `n` anomalies of `func_id` for this frame.
    pub fn add_abnormal(&mut self, func_id: u64, n: u64) {
        *self.abnormal.entry(func_id).or_insert(0) += n;
        self.local.entry(func_id).or_default().add_abnormal(n);
    }

    /// Reports this frame's anomaly counts to the aggregator.
    pub async fn push_abnormal<A: StatsAggregator>(&self, aggregator: Option<&A>) {
        let Some(aggregator) = aggregator else {
            return;
        };
        if self.abnormal.is_empty() {
            return;
        }
        if let Err(e) = aggregator.add_abnormal_all(self.abnormal.clone()).await {
            warn!(error = %e, functions = self.abnormal.len(), "abnormal count push failed");
        }
    }

    pub fn frame_abnormal(&self) -> &HashMap<u64, u64> {
        &self.abnormal
    }

    pub fn local_stats(&self, func_id: u64) -> Option<&RunStats> {
        self.local.get(&func_id)
    }

    /// Functions with at least one anomaly this frame whose deepest observed
    /// nesting is below `max_depth_of_interest`, sorted by id.
    pub fn functions_of_interest(&self, max_depth: impl Fn(u64) -> usize) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .abnormal
            .iter()
            .filter(|(id, n)| **n > 0 && max_depth(**id) < self.config.max_depth_of_interest)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

//! Per-rank frame loop.
//!
//! One frame is fully applied to the call stacks, then its statistics are
//! folded and pushed, then its calls are labelled. A call-stack violation
//! halts the rank; the frame status is returned as a value.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::callstack::{CallStackEngine, CallStackViolation, ExecData, IngestError};
use crate::config::DetectorConfig;
use crate::event::stats::EventStats;
use crate::event::{Frame, FunctionTable};
use crate::outlier::OutlierDetector;
use crate::ps::StatsAggregator;
use crate::reader::FrameSource;
use crate::sink::Sink;

/// Labelled result of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameOutput {
    pub step: u64,
    pub rank: u64,
    /// Calls closed during the frame, grouped by function id.
    pub records: Vec<ExecData>,
    pub functions_of_interest: Vec<u64>,
    /// Anomalies labelled this frame, per function id.
    pub n_abnormal: HashMap<u64, u64>,
    /// Whether merged statistics from the aggregator drove classification.
    pub used_global_stats: bool,
}

impl FrameOutput {
    pub fn anomalies(&self) -> u64 {
        self.n_abnormal.values().sum()
    }
}

/// Outcome of [`RankDriver::process_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStatus {
    Completed(FrameOutput),
    /// No call or communication events.
    Empty { step: u64 },
    /// A call-stack violation stopped the frame at `event_index`.
    Aborted {
        step: u64,
        event_index: usize,
        violation: CallStackViolation,
    },
    /// The driver was halted by an earlier violation.
    Skipped { step: u64 },
}

impl FrameStatus {
    pub fn step(&self) -> u64 {
        match self {
            Self::Completed(out) => out.step,
            Self::Empty { step } | Self::Aborted { step, .. } | Self::Skipped { step } => *step,
        }
    }
}

/// Totals reported when a rank finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalReport {
    /// Frames processed, empty ones included.
    pub frames: u64,
    pub events: u64,
    pub anomalies: u64,
    /// Calls still open at the end of the stream.
    pub open_calls: usize,
    /// Step of the frame that halted the rank.
    pub aborted_at: Option<u64>,
}

/// Runs the engine, the detector and the aggregator for one rank.
pub struct RankDriver<A> {
    rank: u64,
    engine: CallStackEngine,
    detector: OutlierDetector,
    aggregator: Option<A>,
    event_stats: EventStats,
    frames: u64,
    events: u64,
    anomalies: u64,
    aborted_at: Option<u64>,
}

impl<A: StatsAggregator> RankDriver<A> {
    /// Without an aggregator the rank classifies against its local statistics only.
    pub fn new(
        rank: u64,
        functions: FunctionTable,
        detector: DetectorConfig,
        aggregator: Option<A>,
    ) -> Self {
        Self {
            rank,
            engine: CallStackEngine::new(functions),
            detector: OutlierDetector::new(detector),
            aggregator,
            event_stats: EventStats::new(),
            frames: 0,
            events: 0,
            anomalies: 0,
            aborted_at: None,
        }
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }

    pub fn engine(&self) -> &CallStackEngine {
        &self.engine
    }

    pub fn is_halted(&self) -> bool {
        self.aborted_at.is_some()
    }

    pub async fn process_frame(&mut self, frame: &Frame) -> FrameStatus {
        let step = frame.step;

        if self.is_halted() {
            debug!(rank = self.rank, step, "rank halted, skipping frame");
            return FrameStatus::Skipped { step };
        }

        self.frames += 1;

        if frame.is_empty() {
            debug!(rank = self.rank, step, "empty frame");
            return FrameStatus::Empty { step };
        }

        self.engine.begin_frame();
        self.detector.init_local_stat();

        if let Err(IngestError {
            event_index,
            violation,
        }) = self.engine.ingest(frame, &self.event_stats)
        {
            error!(
                rank = self.rank,
                step,
                event_index,
                error = %violation,
                "call-stack violation, halting rank"
            );
            let dropped = self.engine.release_frame();
            debug!(rank = self.rank, records = dropped.len(), "dropped partial frame");
            self.aborted_at = Some(step);
            return FrameStatus::Aborted {
                step,
                event_index,
                violation,
            };
        }
        self.events += frame.len() as u64;

        let samples: Vec<_> = self
            .engine
            .frame_functions()
            .into_iter()
            .map(|func_id| (func_id, self.engine.frame_samples(func_id)))
            .collect();

        for (func_id, xs) in &samples {
            self.detector.add_local_stat(xs, *func_id);
        }

        let used_global_stats = self
            .detector
            .push_local_stat(self.aggregator.as_ref())
            .await;

        for (func_id, xs) in &samples {
            let labels = self.detector.comp_outlier(xs, *func_id);
            self.engine.set_labels(*func_id, &labels);
        }

        self.detector.push_abnormal(self.aggregator.as_ref()).await;

        let n_abnormal = self.detector.frame_abnormal().clone();
        let engine = &self.engine;
        let functions_of_interest = self
            .detector
            .functions_of_interest(|func_id| engine.max_depth(func_id));
        let records = self.engine.release_frame();

        let output = FrameOutput {
            step,
            rank: self.rank,
            records,
            functions_of_interest,
            n_abnormal,
            used_global_stats,
        };
        self.anomalies += output.anomalies();

        let counts = self.event_stats.snapshot();
        debug!(
            rank = self.rank,
            step,
            records = output.records.len(),
            anomalies = output.anomalies(),
            used_global_stats,
            events = ?counts,
            "frame processed"
        );

        FrameStatus::Completed(output)
    }

    /// Summarizes the run and reports calls left open.
    pub fn finalize(&self) -> FinalReport {
        let open_calls = self.engine.stack_size();

        if open_calls > 0 {
            for exec in self.engine.open_calls().into_iter().take(10) {
                warn!(
                    rank = self.rank,
                    exec = %exec.id,
                    thread = %exec.key(),
                    function = %exec.func_name,
                    entry = exec.entry,
                    "call never exited"
                );
            }
            warn!(rank = self.rank, open_calls, "call stacks not empty at end of stream");
        }

        let report = FinalReport {
            frames: self.frames,
            events: self.events,
            anomalies: self.anomalies,
            open_calls,
            aborted_at: self.aborted_at,
        };

        info!(
            rank = self.rank,
            frames = report.frames,
            events = report.events,
            anomalies = report.anomalies,
            open_calls,
            "rank finished"
        );

        report
    }

    /// Processes `source` until it is exhausted or the rank halts.
    pub async fn run<S, K>(&mut self, source: &mut S, sink: &mut K) -> Result<FinalReport>
    where
        S: FrameSource,
        K: Sink,
    {
        self.engine.update_functions(source.function_table().clone());

        while let Some(frame) = source.next_frame().context("reading next frame")? {
            match self.process_frame(&frame).await {
                FrameStatus::Completed(output) => {
                    sink.write_frame(&output)
                        .with_context(|| format!("writing frame {} to {}", output.step, sink.name()))?;
                }
                FrameStatus::Empty { .. } => {}
                FrameStatus::Aborted { .. } | FrameStatus::Skipped { .. } => break,
            }
        }

        Ok(self.finalize())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::event::{CallEvent, ThreadKey};
    use crate::outlier::Label;
    use crate::ps::{InProcess, ParameterServer};
    use crate::reader::MemorySource;
    use crate::sink::MemorySink;

    const K: ThreadKey = ThreadKey::new(0, 0, 0);

    fn detector() -> DetectorConfig {
        DetectorConfig {
            sigma: 2.0,
            ..Default::default()
        }
    }

    /// `main` wrapping ten calls to `work` with the given runtimes.
    fn frame(step: u64, runtimes: &[u64]) -> Frame {
        let mut f = Frame::new(step);
        let mut ts = step * 1_000_000;
        f.call_events.push(CallEvent::entry(K, 0, ts));
        for r in runtimes {
            ts += 1;
            f.call_events.push(CallEvent::entry(K, 1, ts));
            ts += r;
            f.call_events.push(CallEvent::exit(K, 1, ts));
        }
        f.call_events.push(CallEvent::exit(K, 0, ts + 1));
        f
    }

    const SPIKY: [u64; 10] = [96, 68, 100, 79, 10, 2000, 894, 97, 10, 97];

    #[tokio::test]
    async fn test_completed_frame_labels_spike() {
        let mut driver: RankDriver<InProcess> =
            RankDriver::new(0, FunctionTable::new(), detector(), None);

        let status = driver.process_frame(&frame(0, &SPIKY)).await;
        let FrameStatus::Completed(out) = status else {
            panic!("expected completed frame, got {status:?}");
        };

        assert_eq!(out.records.len(), 11);
        assert_eq!(out.n_abnormal.get(&1), Some(&1));
        assert_eq!(out.functions_of_interest, vec![1]);
        assert!(!out.used_global_stats);

        let flagged: Vec<u64> = out
            .records
            .iter()
            .filter(|r| r.label == Label::Anomalous)
            .filter_map(|r| r.runtime)
            .collect();
        assert_eq!(flagged, vec![2000]);
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut driver: RankDriver<InProcess> =
            RankDriver::new(0, FunctionTable::new(), detector(), None);
        assert_eq!(
            driver.process_frame(&Frame::new(4)).await,
            FrameStatus::Empty { step: 4 }
        );
        assert!(!driver.is_halted());
        assert_eq!(driver.finalize().frames, 1);
    }

    #[tokio::test]
    async fn test_violation_halts_rank() {
        let mut driver: RankDriver<InProcess> =
            RankDriver::new(0, FunctionTable::new(), detector(), None);

        let mut bad = Frame::new(1);
        bad.call_events = vec![
            CallEvent::entry(K, 0, 1),
            CallEvent::entry(K, 1, 2),
            CallEvent::exit(K, 0, 3),
        ];

        let status = driver.process_frame(&bad).await;
        assert!(matches!(
            status,
            FrameStatus::Aborted {
                step: 1,
                event_index: 2,
                violation: CallStackViolation::FunctionMismatch { .. },
            }
        ));
        assert!(driver.is_halted());

        // Later frames are refused.
        let next = driver.process_frame(&frame(2, &[5])).await;
        assert_eq!(next, FrameStatus::Skipped { step: 2 });

        let report = driver.finalize();
        assert_eq!(report.aborted_at, Some(1));
        assert_eq!(report.open_calls, 1);
    }

    #[tokio::test]
    async fn test_ranks_share_global_statistics() {
        let ps = Arc::new(ParameterServer::new());

        let mut quiet = RankDriver::new(
            0,
            FunctionTable::new(),
            detector(),
            Some(InProcess::new(ps.clone())),
        );
        let mut spiky = RankDriver::new(
            1,
            FunctionTable::new(),
            detector(),
            Some(InProcess::new(ps.clone())),
        );

        quiet.process_frame(&frame(0, &[100; 10])).await;
        let status = spiky.process_frame(&frame(0, &SPIKY)).await;
        let FrameStatus::Completed(out) = status else {
            panic!("expected completed frame, got {status:?}");
        };

        assert!(out.used_global_stats);
        assert_eq!(ps.get(1).count(), (20, 1));
        assert_eq!(ps.get(0).count().0, 2);
    }

    #[tokio::test]
    async fn test_run_reports_open_calls() {
        let mut unterminated = Frame::new(1);
        unterminated.call_events.push(CallEvent::entry(K, 0, 5_000_000));

        let mut source = MemorySource::new(
            FunctionTable::from_iter([(0, "main".to_string()), (1, "work".to_string())]),
            vec![frame(0, &[10, 12]), Frame::new(5), unterminated],
        );
        let mut sink = MemorySink::new();
        let mut driver: RankDriver<InProcess> =
            RankDriver::new(3, FunctionTable::new(), detector(), None);

        let report = driver.run(&mut source, &mut sink).await.expect("run");

        assert_eq!(report.frames, 3);
        assert_eq!(report.open_calls, 1);
        assert_eq!(report.aborted_at, None);
        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.frames[0].rank, 3);
        assert_eq!(sink.frames[0].records[0].func_name, "main");
        assert!(sink.frames[1].records.is_empty());
    }
}

//! Phase resolution: decides, from persisted state alone, which unit of
//! work a run needs next.
//!
//! `next_phase` is pure: identical inputs always give the same answer and
//! nothing is read or written. The Step Executor calls it at the start of
//! every invocation.

use crate::types::{Hypothesis, HypothesisId, ProcessingStatus, ProgressInfo, Run, RunStatus};
use crate::types::STEP_RESEARCH_DONE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default cap on hypotheses with outstanding deep-research handles.
pub const DEFAULT_MAX_CONCURRENT_RESEARCH: usize = 5;

/// The next unit of work for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Start run-level research over both input documents.
    #[serde(rename = "step2_1_start")]
    Step2_1Start,
    /// Poll the run-level research handle.
    #[serde(rename = "step2_1_polling")]
    Step2_1Polling,
    /// Structure the raw research text into hypothesis records.
    #[serde(rename = "step2_1_5")]
    Step2_1_5,
    /// Start per-hypothesis research for pending or stuck hypotheses.
    #[serde(rename = "step2_2_start")]
    Step2_2Start,
    /// Poll outstanding per-hypothesis research handles.
    #[serde(rename = "step2_2_polling")]
    Step2_2Polling,
    /// Advance one hypothesis through its scoring stages.
    #[serde(rename = "evaluation")]
    Evaluation,
    /// Every hypothesis is finished; close the run.
    #[serde(rename = "completed")]
    Completed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Step2_1Start => "step2_1_start",
            Phase::Step2_1Polling => "step2_1_polling",
            Phase::Step2_1_5 => "step2_1_5",
            Phase::Step2_2Start => "step2_2_start",
            Phase::Step2_2Polling => "step2_2_polling",
            Phase::Evaluation => "evaluation",
            Phase::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a single hypothesis stands, derived from its persisted fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypothesisState {
    /// Not started: no handle, no output.
    AwaitingStart,
    /// Handle present, output absent.
    Polling,
    /// Status advanced to research but neither handle nor output exists.
    Stuck,
    /// Research output present, scoring not started.
    ReadyForEvaluation,
    /// One of the scoring stages is in progress.
    InEvaluation,
    /// Completed or errored.
    Finished,
}

impl HypothesisState {
    pub fn of(hypothesis: &Hypothesis) -> Self {
        let status = hypothesis.processing_status;
        if status.is_finished() {
            return HypothesisState::Finished;
        }
        if status.is_evaluation_stage() {
            return HypothesisState::InEvaluation;
        }
        if hypothesis.has_research_output() {
            return HypothesisState::ReadyForEvaluation;
        }
        if hypothesis.pending_operation().is_some() {
            return HypothesisState::Polling;
        }
        match status {
            ProcessingStatus::Step2_2 => HypothesisState::Stuck,
            _ => HypothesisState::AwaitingStart,
        }
    }
}

/// Hypotheses of one run grouped by `HypothesisState`, each group in
/// ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HypothesisPartition {
    pub pending: Vec<HypothesisId>,
    pub polling: Vec<HypothesisId>,
    pub stuck: Vec<HypothesisId>,
    pub ready: Vec<HypothesisId>,
    pub in_evaluation: Vec<HypothesisId>,
    pub finished: Vec<HypothesisId>,
}

impl HypothesisPartition {
    pub fn of(hypotheses: &[Hypothesis]) -> Self {
        let mut ordered: Vec<&Hypothesis> = hypotheses.iter().collect();
        ordered.sort_by_key(|h| (h.ordinal, h.id));

        let mut partition = Self::default();
        for hypothesis in ordered {
            let bucket = match HypothesisState::of(hypothesis) {
                HypothesisState::AwaitingStart => &mut partition.pending,
                HypothesisState::Polling => &mut partition.polling,
                HypothesisState::Stuck => &mut partition.stuck,
                HypothesisState::ReadyForEvaluation => &mut partition.ready,
                HypothesisState::InEvaluation => &mut partition.in_evaluation,
                HypothesisState::Finished => &mut partition.finished,
            };
            bucket.push(hypothesis.id);
        }
        partition
    }

    pub fn total(&self) -> usize {
        self.pending.len()
            + self.polling.len()
            + self.stuck.len()
            + self.ready.len()
            + self.in_evaluation.len()
            + self.finished.len()
    }

    /// Hypotheses eligible for a research start: never started plus stuck.
    pub fn start_candidates(&self) -> usize {
        self.pending.len() + self.stuck.len()
    }
}

/// Map persisted run state to the next unit of work.
///
/// Decision order, first match wins:
/// 1. terminal or paused run → `None`
/// 2. run-level handle → `Step2_1Polling`
/// 3. legacy single-hypothesis handle → `Step2_2Polling`
/// 4. pending run → `Step2_1Start`
/// 5. running, no hypotheses, research output stored → `Step2_1_5`
/// 6. per-hypothesis: polling, then starting (below the cap), then
///    evaluation, then completion once everything is finished.
pub fn next_phase(
    status: RunStatus,
    current_step: u32,
    hypotheses: &[Hypothesis],
    progress_info: Option<&ProgressInfo>,
    max_concurrent: usize,
) -> Option<Phase> {
    if status.is_terminal() || status == RunStatus::Paused {
        return None;
    }

    if let Some(info) = progress_info {
        if info.deep_research.is_some() {
            return Some(Phase::Step2_1Polling);
        }
        if info.legacy_hypothesis_research.is_some() {
            return Some(Phase::Step2_2Polling);
        }
    }

    if status == RunStatus::Pending {
        return Some(Phase::Step2_1Start);
    }

    if hypotheses.is_empty() {
        if status == RunStatus::Running && current_step >= STEP_RESEARCH_DONE {
            return Some(Phase::Step2_1_5);
        }
        return None;
    }

    let partition = HypothesisPartition::of(hypotheses);

    if !partition.polling.is_empty() {
        return Some(Phase::Step2_2Polling);
    }
    // Nothing is polling here, so this only rejects a zero cap. The number
    // started per step is bounded by the free slots in the start handler.
    if partition.start_candidates() > 0 && partition.polling.len() < max_concurrent {
        return Some(Phase::Step2_2Start);
    }
    if !partition.ready.is_empty() || !partition.in_evaluation.is_empty() {
        return Some(Phase::Evaluation);
    }
    if partition.finished.len() == partition.total() {
        return Some(Phase::Completed);
    }

    None
}

/// Convenience wrapper over `next_phase` for a loaded run.
pub fn next_phase_for_run(
    run: &Run,
    hypotheses: &[Hypothesis],
    max_concurrent: usize,
) -> Option<Phase> {
    next_phase(
        run.status,
        run.current_step,
        hypotheses,
        Some(&run.progress_info),
        max_concurrent,
    )
}

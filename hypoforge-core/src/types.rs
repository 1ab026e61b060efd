//! Persisted pipeline records: runs, hypotheses, input resources, and the
//! partial updates the Step Executor writes back.
//!
//! Everything needed to resume a run lives in these records. The unified
//! `PendingOperation` value is the only place an outstanding deep-research
//! handle is kept, attached either to a run's `ProgressInfo` or to a
//! hypothesis's `HypothesisData`.

use crate::phase::Phase;
use crate::scoring::{BusinessScores, TechnicalScores};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RunId = i64;
pub type HypothesisId = i64;
pub type ResourceId = i64;
pub type ProjectId = i64;

/// `current_step`: run-level research has not been started.
pub const STEP_NOT_STARTED: u32 = 0;
/// `current_step`: run-level research is in flight.
pub const STEP_RESEARCH_STARTED: u32 = 1;
/// `current_step`: run-level research output is stored on the run.
pub const STEP_RESEARCH_DONE: u32 = 2;
/// `current_step`: hypotheses have been structured and created.
pub const STEP_HYPOTHESES_CREATED: u32 = 3;
/// `current_step`: the run has finished.
pub const STEP_COMPLETED: u32 = 4;

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl RunStatus {
    /// Completed, errored and cancelled runs never do more work.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-hypothesis processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "step2_2")]
    Step2_2,
    #[serde(rename = "step3")]
    Step3,
    #[serde(rename = "step4")]
    Step4,
    #[serde(rename = "step5")]
    Step5,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "error")]
    Error,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Step2_2 => "step2_2",
            ProcessingStatus::Step3 => "step3",
            ProcessingStatus::Step4 => "step4",
            ProcessingStatus::Step5 => "step5",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn is_evaluation_stage(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Step3 | ProcessingStatus::Step4 | ProcessingStatus::Step5
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Error)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to an external deep-research task.
///
/// The core never interprets these values; it only hands them back to the
/// AI collaborator to poll or clean up the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepResearchHandle {
    pub interaction_id: String,
    pub store_name: String,
}

impl DeepResearchHandle {
    pub fn new(interaction_id: impl Into<String>, store_name: impl Into<String>) -> Self {
        Self {
            interaction_id: interaction_id.into(),
            store_name: store_name.into(),
        }
    }
}

/// An outstanding asynchronous operation owned by a run or a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub handle: DeepResearchHandle,
    pub started_at: DateTime<Utc>,
    /// Number of "still running" polls observed so far.
    #[serde(default)]
    pub polls: u32,
}

impl PendingOperation {
    pub fn new(handle: DeepResearchHandle) -> Self {
        Self {
            handle,
            started_at: Utc::now(),
            polls: 0,
        }
    }
}

/// Handle layout written by older versions, which tracked a single
/// hypothesis's research on the run itself.
///
/// Only read and cleared; new code stores per-hypothesis handles in
/// `HypothesisData::pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyHypothesisOperation {
    pub hypothesis_id: HypothesisId,
    pub handle: DeepResearchHandle,
}

/// Restricts which previously generated hypotheses are shown to the
/// research stage so it avoids proposing them again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExclusionFilter {
    /// Only hypotheses from these runs; empty means every run of the project.
    #[serde(default)]
    pub run_ids: Vec<RunId>,
    /// Only hypotheses in these stages; empty means any stage.
    #[serde(default)]
    pub statuses: Vec<ProcessingStatus>,
}

impl ExclusionFilter {
    pub fn matches(&self, hypothesis: &Hypothesis) -> bool {
        (self.run_ids.is_empty() || self.run_ids.contains(&hypothesis.run_id))
            && (self.statuses.is_empty() || self.statuses.contains(&hypothesis.processing_status))
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Free-form progress bag stored on a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Run-level deep-research operation, if one is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_research: Option<PendingOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_hypothesis_research: Option<LegacyHypothesisOperation>,
    /// Human-readable progress text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusion_filter: Option<ExclusionFilter>,
    /// Consecutive steps that ended in a transient provider error.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub transient_failures: u32,
    /// Keys written by other components, preserved untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProgressInfo {
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// One pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub job_name: String,
    /// Resource describing the market need / target specification.
    pub target_spec_id: ResourceId,
    /// Resource describing the technical assets to exploit.
    pub technical_assets_id: ResourceId,
    pub hypothesis_count: u32,
    pub status: RunStatus,
    pub current_step: u32,
    #[serde(default)]
    pub progress_info: ProgressInfo,
    /// Raw text returned by the run-level research stage.
    #[serde(default)]
    pub research_output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn has_research_output(&self) -> bool {
        self.research_output
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }
}

/// Data bag stored alongside a hypothesis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypothesisData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Per-hypothesis deep-research operation, if one is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingOperation>,
    /// How many times research was restarted after the handle was lost.
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_scores: Option<BusinessScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_scores: Option<TechnicalScores>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub score_warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One candidate business idea spawned by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: HypothesisId,
    pub run_id: RunId,
    /// Zero-based position in the structured output.
    pub ordinal: u32,
    pub title: String,
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub research_output: Option<String>,
    #[serde(default)]
    pub step3_output: Option<String>,
    #[serde(default)]
    pub step4_output: Option<String>,
    #[serde(default)]
    pub step5_output: Option<String>,
    #[serde(default)]
    pub full_data: HypothesisData,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hypothesis {
    pub fn has_research_output(&self) -> bool {
        self.research_output
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }

    pub fn pending_operation(&self) -> Option<&PendingOperation> {
        self.full_data.pending.as_ref()
    }

    pub fn summary(&self) -> &str {
        self.full_data.summary.as_deref().unwrap_or("")
    }
}

/// An input document referenced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub project_id: ProjectId,
    pub name: String,
    pub content: String,
}

/// Fields for a run created by the submission layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub project_id: ProjectId,
    pub job_name: String,
    pub target_spec_id: ResourceId,
    pub technical_assets_id: ResourceId,
    pub hypothesis_count: u32,
    pub exclusion_filter: Option<ExclusionFilter>,
}

/// Fields for a hypothesis created by the structuring stage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHypothesis {
    pub run_id: RunId,
    pub ordinal: u32,
    pub title: String,
    pub summary: String,
}

/// Partial update of a run. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_step: Option<u32>,
    pub progress_info: Option<ProgressInfo>,
    pub research_output: Option<String>,
    pub error_message: Option<String>,
}

impl RunUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_step(mut self, step: u32) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn progress_info(mut self, info: ProgressInfo) -> Self {
        self.progress_info = Some(info);
        self
    }

    pub fn research_output(mut self, text: impl Into<String>) -> Self {
        self.research_output = Some(text.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Apply the update and stamp `updated_at`.
    pub fn apply(self, run: &mut Run, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(step) = self.current_step {
            run.current_step = step;
        }
        if let Some(info) = self.progress_info {
            run.progress_info = info;
        }
        if let Some(text) = self.research_output {
            run.research_output = Some(text);
        }
        if let Some(message) = self.error_message {
            run.error_message = Some(message);
        }
        run.updated_at = now;
    }
}

/// Partial update of a hypothesis. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HypothesisUpdate {
    pub processing_status: Option<ProcessingStatus>,
    pub research_output: Option<String>,
    pub step3_output: Option<String>,
    pub step4_output: Option<String>,
    pub step5_output: Option<String>,
    pub full_data: Option<HypothesisData>,
    pub error_message: Option<String>,
}

impl HypothesisUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProcessingStatus) -> Self {
        self.processing_status = Some(status);
        self
    }

    pub fn research_output(mut self, text: impl Into<String>) -> Self {
        self.research_output = Some(text.into());
        self
    }

    pub fn step3_output(mut self, text: impl Into<String>) -> Self {
        self.step3_output = Some(text.into());
        self
    }

    pub fn step4_output(mut self, text: impl Into<String>) -> Self {
        self.step4_output = Some(text.into());
        self
    }

    pub fn step5_output(mut self, text: impl Into<String>) -> Self {
        self.step5_output = Some(text.into());
        self
    }

    pub fn full_data(mut self, data: HypothesisData) -> Self {
        self.full_data = Some(data);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Apply the update and stamp `updated_at`.
    pub fn apply(self, hypothesis: &mut Hypothesis, now: DateTime<Utc>) {
        if let Some(status) = self.processing_status {
            hypothesis.processing_status = status;
        }
        if let Some(text) = self.research_output {
            hypothesis.research_output = Some(text);
        }
        if let Some(text) = self.step3_output {
            hypothesis.step3_output = Some(text);
        }
        if let Some(text) = self.step4_output {
            hypothesis.step4_output = Some(text);
        }
        if let Some(text) = self.step5_output {
            hypothesis.step5_output = Some(text);
        }
        if let Some(data) = self.full_data {
            hypothesis.full_data = data;
        }
        if let Some(message) = self.error_message {
            hypothesis.error_message = Some(message);
        }
        hypothesis.updated_at = now;
    }
}

/// What one `execute_step` invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub run_id: RunId,
    /// Phase that was executed; `None` when there was nothing to do.
    pub phase: Option<Phase>,
    /// Whether the caller should invoke the executor again.
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn advanced(run_id: RunId, phase: Phase, has_more: bool) -> Self {
        Self {
            run_id,
            phase: Some(phase),
            has_more,
            error: None,
        }
    }

    pub fn idle(run_id: RunId, error: Option<String>) -> Self {
        Self {
            run_id,
            phase: None,
            has_more: false,
            error,
        }
    }

    pub fn failed(run_id: RunId, phase: Option<Phase>, error: impl Into<String>) -> Self {
        Self {
            run_id,
            phase,
            has_more: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hypothesis() -> Hypothesis {
        let now = Utc::now();
        Hypothesis {
            id: 1,
            run_id: 10,
            ordinal: 0,
            title: "Thermal film for EV batteries".into(),
            processing_status: ProcessingStatus::Pending,
            research_output: None,
            step3_output: None,
            step4_output: None,
            step5_output: None,
            full_data: HypothesisData::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn test_processing_status_wire_names() {
        let json = serde_json::to_string(&ProcessingStatus::Step2_2).unwrap();
        assert_eq!(json, "\"step2_2\"");
        let parsed: ProcessingStatus = serde_json::from_str("\"step4\"").unwrap();
        assert_eq!(parsed, ProcessingStatus::Step4);
        assert_eq!(ProcessingStatus::Step5.to_string(), "step5");
    }

    #[test]
    fn test_progress_info_preserves_unknown_keys() {
        let raw = r#"{"message":"working","uiHint":{"color":"blue"}}"#;
        let info: ProgressInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.message.as_deref(), Some("working"));
        assert!(info.deep_research.is_none());
        assert!(info.extra.contains_key("uiHint"));

        let back = serde_json::to_value(&info).unwrap();
        assert_eq!(back["uiHint"]["color"], "blue");
    }

    #[test]
    fn test_hypothesis_update_apply() {
        let mut hypothesis = sample_hypothesis();
        let later = hypothesis.updated_at + chrono::Duration::seconds(5);
        HypothesisUpdate::new()
            .status(ProcessingStatus::Step2_2)
            .research_output("findings")
            .apply(&mut hypothesis, later);

        assert_eq!(hypothesis.processing_status, ProcessingStatus::Step2_2);
        assert!(hypothesis.has_research_output());
        assert!(hypothesis.step3_output.is_none());
        assert_eq!(hypothesis.updated_at, later);
    }

    #[test]
    fn test_blank_research_output_is_absent() {
        let mut hypothesis = sample_hypothesis();
        hypothesis.research_output = Some("   \n".into());
        assert!(!hypothesis.has_research_output());
    }

    #[test]
    fn test_exclusion_filter_matches() {
        let hypothesis = sample_hypothesis();
        assert!(ExclusionFilter::default().matches(&hypothesis));

        let other_run = ExclusionFilter {
            run_ids: vec![99],
            statuses: vec![],
        };
        assert!(!other_run.matches(&hypothesis));

        let completed_only = ExclusionFilter {
            run_ids: vec![],
            statuses: vec![ProcessingStatus::Completed],
        };
        assert!(!completed_only.matches(&hypothesis));
    }
}

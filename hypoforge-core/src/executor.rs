//! Step Executor. Performs exactly one unit of work per invocation.
//!
//! `execute_step` loads a run and its hypotheses, asks the Phase Resolver
//! what comes next, runs the matching handler and persists the result.
//! Nothing is kept in memory between invocations; every handler writes the
//! state the next invocation needs, and every successful handler touches
//! the run so `updated_at` doubles as a liveness signal.
//!
//! Errors are split in two. Infrastructure trouble (store persistence
//! failures, transient provider errors) is returned as `Err` without
//! marking the run failed, for the caller to retry. Everything else is
//! terminal for the entity it concerns: the run is marked `error`, or for
//! per-hypothesis work only that hypothesis is. Transient provider errors
//! are counted on the run, and once `max_transient_failures` of them occur
//! in a row the run is failed too.

use crate::ai::{AiClient, ResearchFile, ResearchPoll, is_retryable};
use crate::config::EngineConfig;
use crate::error::{AiError, HypoforgeError, PipelineError, StoreError};
use crate::extraction::{StructuringSource, structure_research_output};
use crate::phase::{HypothesisPartition, Phase, next_phase_for_run};
use crate::prompts::{PromptTemplates, render};
use crate::scoring::business::BUSINESS_RUBRIC;
use crate::scoring::technical::TECHNICAL_RUBRIC;
use crate::scoring::{parse_business_scores, parse_technical_scores};
use crate::store::PipelineStore;
use crate::types::{
    DeepResearchHandle, Hypothesis, HypothesisData, HypothesisId, HypothesisUpdate,
    LegacyHypothesisOperation, NewHypothesis, PendingOperation, ProcessingStatus, ProgressInfo,
    Resource, ResourceId, Run, RunId, RunStatus, RunUpdate, STEP_COMPLETED,
    STEP_HYPOTHESES_CREATED, STEP_RESEARCH_DONE, STEP_RESEARCH_STARTED, StepOutcome,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of polling one per-hypothesis research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollResult {
    Completed,
    Running,
    Failed,
}

/// Scoring stage a hypothesis needs next, derived from its stored outputs.
pub fn evaluation_stage(hypothesis: &Hypothesis) -> ProcessingStatus {
    if hypothesis.step3_output.is_none() {
        ProcessingStatus::Step3
    } else if hypothesis.step4_output.is_none() {
        ProcessingStatus::Step4
    } else if hypothesis.step5_output.is_none() {
        ProcessingStatus::Step5
    } else {
        ProcessingStatus::Completed
    }
}

/// Errors the caller should retry rather than record on the run.
pub fn is_transient(err: &HypoforgeError) -> bool {
    match err {
        HypoforgeError::Store(StoreError::Persistence { .. }) => true,
        HypoforgeError::Ai(e) => is_retryable(e),
        _ => false,
    }
}

fn remote_store_name(scope: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("hypoforge-{scope}-{}", &suffix[..8])
}

pub struct StepExecutor {
    store: Arc<dyn PipelineStore>,
    ai: Arc<dyn AiClient>,
    engine: EngineConfig,
    prompts: PromptTemplates,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        ai: Arc<dyn AiClient>,
        engine: EngineConfig,
        prompts: PromptTemplates,
    ) -> Self {
        Self {
            store,
            ai,
            engine,
            prompts,
        }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    /// Run one unit of work for `run_id`.
    ///
    /// `Err` is returned only for transient failures. The run is not marked
    /// as failed in that case and the call may simply be repeated; whatever
    /// the handler already persisted is picked up by the next resolution.
    pub async fn execute_step(&self, run_id: RunId) -> Result<StepOutcome, HypoforgeError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            warn!(run_id, "Run not found");
            return Ok(StepOutcome::failed(
                run_id,
                None,
                StoreError::RunNotFound { run_id }.to_string(),
            ));
        };
        let hypotheses = self.store.get_hypotheses_for_run(run_id).await?;

        let Some(phase) =
            next_phase_for_run(&run, &hypotheses, self.engine.max_concurrent_research)
        else {
            if matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                warn!(
                    run_id,
                    status = %run.status,
                    current_step = run.current_step,
                    hypotheses = hypotheses.len(),
                    "No phase resolved for a live run"
                );
            } else {
                debug!(run_id, status = %run.status, "Run has no further work");
            }
            let error = match run.status {
                RunStatus::Error => run.error_message.clone(),
                _ => None,
            };
            return Ok(StepOutcome::idle(run_id, error));
        };

        debug!(run_id, phase = %phase, "Resolved next phase");

        let result = match phase {
            Phase::Step2_1Start => self.start_run_research(&run).await,
            Phase::Step2_1Polling => self.poll_run_research(&run).await,
            Phase::Step2_1_5 => self.structure_hypotheses(&run).await,
            Phase::Step2_2Start => self.start_hypothesis_research(&run, &hypotheses).await,
            Phase::Step2_2Polling => self.poll_hypothesis_research(&run, &hypotheses).await,
            Phase::Evaluation => self.evaluate_next(&run, &hypotheses).await,
            Phase::Completed => self.complete_run(&run, &hypotheses).await,
        };

        match result {
            Ok(()) => {
                if run.progress_info.transient_failures > 0 {
                    self.reset_transient_failures(run_id).await?;
                }
                Ok(StepOutcome::advanced(run_id, phase, phase != Phase::Completed))
            }
            Err(e @ HypoforgeError::Ai(_)) if is_transient(&e) => {
                self.record_transient_failure(run_id, phase, e).await
            }
            Err(e) if is_transient(&e) => {
                warn!(run_id, phase = %phase, error = %e, "Transient failure, step can be retried");
                Err(e)
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id, phase = %phase, error = %message, "Phase handler failed");
                self.fail_run(&run, &message).await?;
                Ok(StepOutcome::failed(run_id, Some(phase), message))
            }
        }
    }

    async fn fail_run(&self, run: &Run, message: &str) -> Result<(), StoreError> {
        let info = ProgressInfo {
            deep_research: None,
            ..run.progress_info.clone()
        }
        .with_message(format!("Error: {message}"));
        self.store
            .update_run_status(
                run.id,
                RunUpdate::new()
                    .status(RunStatus::Error)
                    .error_message(message)
                    .progress_info(info),
            )
            .await?;
        Ok(())
    }

    /// Count a transient provider failure against the run. Returns the
    /// error for the caller to retry, or a failed outcome once the run has
    /// hit `max_transient_failures` in a row.
    async fn record_transient_failure(
        &self,
        run_id: RunId,
        phase: Phase,
        err: HypoforgeError,
    ) -> Result<StepOutcome, HypoforgeError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Err(err);
        };
        let failures = run.progress_info.transient_failures + 1;
        if failures >= self.engine.max_transient_failures {
            let message = format!("gave up after {failures} consecutive transient failures: {err}");
            error!(run_id, phase = %phase, failures, error = %err, "Transient failure limit reached");
            if let Some(operation) = &run.progress_info.deep_research {
                self.cleanup(&operation.handle).await;
            }
            self.fail_run(&run, &message).await?;
            return Ok(StepOutcome::failed(run_id, Some(phase), message));
        }

        warn!(
            run_id,
            phase = %phase,
            failures,
            error = %err,
            "Transient failure, step can be retried"
        );
        let info = ProgressInfo {
            transient_failures: failures,
            ..run.progress_info.clone()
        };
        self.touch_run(&run, info).await?;
        Err(err)
    }

    async fn reset_transient_failures(&self, run_id: RunId) -> Result<(), StoreError> {
        if let Some(run) = self.store.get_run(run_id).await? {
            let info = ProgressInfo {
                transient_failures: 0,
                ..run.progress_info.clone()
            };
            self.touch_run(&run, info).await?;
        }
        Ok(())
    }

    async fn touch_run(&self, run: &Run, info: ProgressInfo) -> Result<(), StoreError> {
        self.store
            .update_run_status(run.id, RunUpdate::new().progress_info(info))
            .await?;
        Ok(())
    }

    async fn load_resource(&self, id: ResourceId) -> Result<Resource, HypoforgeError> {
        self.store
            .get_resource(id)
            .await?
            .ok_or_else(|| StoreError::ResourceNotFound { id }.into())
    }

    async fn load_inputs(&self, run: &Run) -> Result<(Resource, Resource), HypoforgeError> {
        let target = self.load_resource(run.target_spec_id).await?;
        let assets = self.load_resource(run.technical_assets_id).await?;
        Ok((target, assets))
    }

    /// Release a remote task. Failures are logged, never raised.
    async fn cleanup(&self, handle: &DeepResearchHandle) {
        if let Err(e) = self.ai.cleanup_deep_research(handle).await {
            warn!(
                interaction_id = handle.interaction_id.as_str(),
                error = %e,
                "Deep research cleanup failed"
            );
        }
    }

    // ── Step 2-1: run-level research ────────────────────────────────────

    async fn start_run_research(&self, run: &Run) -> Result<(), HypoforgeError> {
        let (target, assets) = self.load_inputs(run).await?;

        let existing = match &run.progress_info.exclusion_filter {
            Some(filter) => self
                .store
                .get_existing_hypotheses(run.project_id, filter)
                .await?
                .into_iter()
                .filter(|h| h.run_id != run.id)
                .map(|h| format!("- {}", h.title))
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };
        let existing = if existing.is_empty() {
            "(none)".to_string()
        } else {
            existing.join("\n")
        };

        let count = run.hypothesis_count.to_string();
        let prompt = render(
            &self.prompts.research,
            &[
                ("HYPOTHESIS_COUNT", count.as_str()),
                ("TARGET_SPEC", target.content.as_str()),
                ("TECHNICAL_ASSETS", assets.content.as_str()),
                ("EXISTING_HYPOTHESES", existing.as_str()),
            ],
        );
        let files = [
            ResearchFile::text(&target.name, target.content.as_str()),
            ResearchFile::text(&assets.name, assets.content.as_str()),
        ];

        let handle = self
            .ai
            .start_deep_research(&prompt, &files, &remote_store_name(&format!("run-{}", run.id)))
            .await?;
        info!(
            run_id = run.id,
            interaction_id = handle.interaction_id.as_str(),
            "Run-level deep research started"
        );

        let info = ProgressInfo {
            deep_research: Some(PendingOperation::new(handle.clone())),
            ..run.progress_info.clone()
        }
        .with_message("Deep research started");
        let update = RunUpdate::new()
            .status(RunStatus::Running)
            .current_step(STEP_RESEARCH_STARTED)
            .progress_info(info);
        if let Err(e) = self.store.update_run_status(run.id, update).await {
            self.cleanup(&handle).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn poll_run_research(&self, run: &Run) -> Result<(), HypoforgeError> {
        let Some(operation) = run.progress_info.deep_research.clone() else {
            return Err(PipelineError::MissingHandle {
                owner: format!("run {}", run.id),
            }
            .into());
        };
        let handle = &operation.handle;

        let poll = match self.ai.check_deep_research(handle).await {
            Ok(poll) => poll,
            Err(e) if is_retryable(&e) => return Err(e.into()),
            Err(e) => ResearchPoll::Failed {
                error: e.to_string(),
            },
        };

        match poll {
            ResearchPoll::Running => {
                let polls = operation.polls + 1;
                let info = ProgressInfo {
                    deep_research: Some(PendingOperation {
                        polls,
                        ..operation.clone()
                    }),
                    ..run.progress_info.clone()
                }
                .with_message(format!("Deep research running (poll {polls})"));
                debug!(run_id = run.id, polls, "Run-level deep research still running");
                self.touch_run(run, info).await?;
                Ok(())
            }
            ResearchPoll::Completed { text } => {
                self.cleanup(handle).await;
                let info = ProgressInfo {
                    deep_research: None,
                    ..run.progress_info.clone()
                }
                .with_message("Deep research completed");
                self.store
                    .update_run_status(
                        run.id,
                        RunUpdate::new()
                            .status(RunStatus::Running)
                            .current_step(STEP_RESEARCH_DONE)
                            .research_output(text)
                            .progress_info(info),
                    )
                    .await?;
                info!(
                    run_id = run.id,
                    interaction_id = handle.interaction_id.as_str(),
                    "Run-level deep research completed"
                );
                Ok(())
            }
            ResearchPoll::Failed { error } => {
                self.cleanup(handle).await;
                Err(AiError::ResearchFailed { message: error }.into())
            }
        }
    }

    // ── Step 2-1.5: structuring ─────────────────────────────────────────

    async fn structure_hypotheses(&self, run: &Run) -> Result<(), HypoforgeError> {
        let raw = run
            .research_output
            .as_deref()
            .ok_or(PipelineError::NoResearchOutput { run_id: run.id })?;

        let count = run.hypothesis_count.to_string();
        let prompt = render(
            &self.prompts.structuring,
            &[("HYPOTHESIS_COUNT", count.as_str()), ("RESEARCH_OUTPUT", raw)],
        );
        let ai_response = match self.ai.generate_content(&prompt).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(run_id = run.id, error = %e, "Structuring call failed, using text patterns");
                None
            }
        };

        let (extracted, source) = structure_research_output(
            ai_response.as_deref(),
            raw,
            &run.job_name,
            self.engine.extraction_limits(),
        );
        if source == StructuringSource::Fallback {
            warn!(run_id = run.id, "No hypotheses found in research output, using job name");
        }

        let batch: Vec<NewHypothesis> = extracted
            .into_iter()
            .enumerate()
            .map(|(ordinal, hypothesis)| NewHypothesis {
                run_id: run.id,
                ordinal: ordinal as u32,
                title: hypothesis.title,
                summary: hypothesis.summary,
            })
            .collect();
        let total = self.store.create_hypotheses(batch).await?.len();

        info!(run_id = run.id, count = total, source = ?source, "Hypotheses structured");
        self.store
            .update_run_status(
                run.id,
                RunUpdate::new()
                    .current_step(STEP_HYPOTHESES_CREATED)
                    .progress_info(
                        run.progress_info
                            .clone()
                            .with_message(format!("{total} hypotheses structured")),
                    ),
            )
            .await?;
        Ok(())
    }

    // ── Step 2-2: per-hypothesis research ───────────────────────────────

    async fn mark_hypothesis_error(
        &self,
        hypothesis: &Hypothesis,
        data: HypothesisData,
        message: &str,
    ) -> Result<(), StoreError> {
        warn!(
            run_id = hypothesis.run_id,
            hypothesis_id = hypothesis.id,
            error = message,
            "Hypothesis failed"
        );
        self.store
            .update_hypothesis(
                hypothesis.id,
                HypothesisUpdate::new()
                    .status(ProcessingStatus::Error)
                    .error_message(message)
                    .full_data(data),
            )
            .await?;
        Ok(())
    }

    async fn start_hypothesis_research(
        &self,
        run: &Run,
        hypotheses: &[Hypothesis],
    ) -> Result<(), HypoforgeError> {
        let partition = HypothesisPartition::of(hypotheses);
        let slots = self
            .engine
            .max_concurrent_research
            .saturating_sub(partition.polling.len());

        let by_id: HashMap<HypothesisId, &Hypothesis> =
            hypotheses.iter().map(|h| (h.id, h)).collect();
        let mut candidates: Vec<&Hypothesis> = partition
            .pending
            .iter()
            .chain(&partition.stuck)
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        candidates.sort_by_key(|h| (h.ordinal, h.id));

        let (target, assets) = self.load_inputs(run).await?;
        let files = [
            ResearchFile::text(&target.name, target.content.as_str()),
            ResearchFile::text(&assets.name, assets.content.as_str()),
        ];

        let (mut started, mut failed) = (0usize, 0usize);
        for hypothesis in candidates {
            if started >= slots {
                break;
            }
            let stuck = partition.stuck.contains(&hypothesis.id);
            let mut data = hypothesis.full_data.clone();

            if stuck {
                if data.restart_count >= self.engine.max_restarts {
                    let message = format!(
                        "research restarted {} times without a result",
                        data.restart_count
                    );
                    self.mark_hypothesis_error(hypothesis, data, &message).await?;
                    failed += 1;
                    continue;
                }
                data.restart_count += 1;
                warn!(
                    run_id = run.id,
                    hypothesis_id = hypothesis.id,
                    restart = data.restart_count,
                    "Restarting stuck hypothesis research"
                );
            }

            let prompt = render(
                &self.prompts.hypothesis_research,
                &[
                    ("TITLE", hypothesis.title.as_str()),
                    ("SUMMARY", hypothesis.summary()),
                    ("TARGET_SPEC", target.content.as_str()),
                    ("TECHNICAL_ASSETS", assets.content.as_str()),
                ],
            );
            let store_name = remote_store_name(&format!("run-{}-hyp-{}", run.id, hypothesis.id));

            match self.ai.start_deep_research(&prompt, &files, &store_name).await {
                Ok(handle) => {
                    data.pending = Some(PendingOperation::new(handle.clone()));
                    let update = HypothesisUpdate::new()
                        .status(ProcessingStatus::Step2_2)
                        .full_data(data);
                    if let Err(e) = self.store.update_hypothesis(hypothesis.id, update).await {
                        self.cleanup(&handle).await;
                        return Err(e.into());
                    }
                    info!(
                        run_id = run.id,
                        hypothesis_id = hypothesis.id,
                        interaction_id = handle.interaction_id.as_str(),
                        "Hypothesis deep research started"
                    );
                    started += 1;
                }
                Err(e) => {
                    let message = format!("failed to start research: {e}");
                    self.mark_hypothesis_error(hypothesis, data, &message).await?;
                    failed += 1;
                }
            }
        }

        let in_flight = partition.polling.len() + started;
        let info = run.progress_info.clone().with_message(format!(
            "Started {started} hypothesis research tasks ({in_flight} in flight, {failed} failed)"
        ));
        self.touch_run(run, info).await?;
        Ok(())
    }

    async fn poll_hypothesis(&self, hypothesis: &Hypothesis) -> Result<PollResult, HypoforgeError> {
        let mut data = hypothesis.full_data.clone();
        let Some(operation) = data.pending.clone() else {
            return Err(PipelineError::MissingHandle {
                owner: format!("hypothesis {}", hypothesis.id),
            }
            .into());
        };
        let handle = &operation.handle;

        let poll = match self.ai.check_deep_research(handle).await {
            Ok(poll) => poll,
            Err(e) if is_retryable(&e) => {
                warn!(
                    hypothesis_id = hypothesis.id,
                    interaction_id = handle.interaction_id.as_str(),
                    error = %e,
                    "Status check failed transiently, will poll again"
                );
                return Ok(PollResult::Running);
            }
            Err(e) => ResearchPoll::Failed {
                error: e.to_string(),
            },
        };

        match poll {
            ResearchPoll::Running => {
                data.pending = Some(PendingOperation {
                    polls: operation.polls + 1,
                    ..operation.clone()
                });
                self.store
                    .update_hypothesis(hypothesis.id, HypothesisUpdate::new().full_data(data))
                    .await?;
                Ok(PollResult::Running)
            }
            ResearchPoll::Completed { text } => {
                self.cleanup(handle).await;
                data.pending = None;
                self.store
                    .update_hypothesis(
                        hypothesis.id,
                        HypothesisUpdate::new().research_output(text).full_data(data),
                    )
                    .await?;
                info!(
                    run_id = hypothesis.run_id,
                    hypothesis_id = hypothesis.id,
                    "Hypothesis deep research completed"
                );
                Ok(PollResult::Completed)
            }
            ResearchPoll::Failed { error } => {
                self.cleanup(handle).await;
                data.pending = None;
                self.mark_hypothesis_error(hypothesis, data, &format!("research failed: {error}"))
                    .await?;
                Ok(PollResult::Failed)
            }
        }
    }

    /// Poll the handle older versions kept on the run itself. Returns the
    /// value to keep in `ProgressInfo`, `None` once it is resolved.
    async fn poll_legacy(
        &self,
        run: &Run,
        legacy: LegacyHypothesisOperation,
    ) -> Result<Option<LegacyHypothesisOperation>, HypoforgeError> {
        let handle = &legacy.handle;
        let poll = match self.ai.check_deep_research(handle).await {
            Ok(poll) => poll,
            Err(e) if is_retryable(&e) => {
                warn!(run_id = run.id, error = %e, "Legacy status check failed transiently");
                return Ok(Some(legacy));
            }
            Err(e) => ResearchPoll::Failed {
                error: e.to_string(),
            },
        };
        if poll == ResearchPoll::Running {
            return Ok(Some(legacy));
        }

        self.cleanup(handle).await;
        let Some(hypothesis) = self.store.get_hypothesis(legacy.hypothesis_id).await? else {
            warn!(
                run_id = run.id,
                hypothesis_id = legacy.hypothesis_id,
                "Legacy research handle points at a missing hypothesis"
            );
            return Ok(None);
        };
        match poll {
            ResearchPoll::Completed { text } => {
                self.store
                    .update_hypothesis(
                        hypothesis.id,
                        HypothesisUpdate::new()
                            .status(ProcessingStatus::Step2_2)
                            .research_output(text),
                    )
                    .await?;
                info!(run_id = run.id, hypothesis_id = hypothesis.id, "Legacy research completed");
            }
            ResearchPoll::Failed { error } => {
                self.mark_hypothesis_error(
                    &hypothesis,
                    hypothesis.full_data.clone(),
                    &format!("research failed: {error}"),
                )
                .await?;
            }
            ResearchPoll::Running => {}
        }
        Ok(None)
    }

    async fn poll_hypothesis_research(
        &self,
        run: &Run,
        hypotheses: &[Hypothesis],
    ) -> Result<(), HypoforgeError> {
        let mut info = run.progress_info.clone();
        if let Some(legacy) = info.legacy_hypothesis_research.take() {
            info.legacy_hypothesis_research = self.poll_legacy(run, legacy).await?;
        }

        let partition = HypothesisPartition::of(hypotheses);
        let (mut completed, mut running, mut failed) = (0usize, 0usize, 0usize);
        for hypothesis in hypotheses.iter().filter(|h| partition.polling.contains(&h.id)) {
            match self.poll_hypothesis(hypothesis).await? {
                PollResult::Completed => completed += 1,
                PollResult::Running => running += 1,
                PollResult::Failed => failed += 1,
            }
        }

        debug!(run_id = run.id, completed, running, failed, "Polled hypothesis research");
        self.touch_run(
            run,
            info.with_message(format!(
                "Hypothesis research: {completed} completed, {running} running, {failed} failed"
            )),
        )
        .await?;
        Ok(())
    }

    // ── Steps 3-5: evaluation ───────────────────────────────────────────

    async fn evaluate_next(&self, run: &Run, hypotheses: &[Hypothesis]) -> Result<(), HypoforgeError> {
        let partition = HypothesisPartition::of(hypotheses);
        let Some(target_id) = partition
            .in_evaluation
            .first()
            .or(partition.ready.first())
            .copied()
        else {
            return Ok(());
        };
        let Some(hypothesis) = hypotheses.iter().find(|h| h.id == target_id) else {
            return Err(StoreError::HypothesisNotFound { id: target_id }.into());
        };

        let stage = evaluation_stage(hypothesis);
        if stage == ProcessingStatus::Completed {
            self.store
                .update_hypothesis(
                    hypothesis.id,
                    HypothesisUpdate::new().status(ProcessingStatus::Completed),
                )
                .await?;
        } else {
            // Persist the stage first so an interrupted call is re-run.
            if hypothesis.processing_status != stage {
                self.store
                    .update_hypothesis(hypothesis.id, HypothesisUpdate::new().status(stage))
                    .await?;
            }
            self.run_evaluation_stage(hypothesis, stage).await?;
        }

        let info = run.progress_info.clone().with_message(format!(
            "Evaluating \"{}\" ({stage})",
            hypothesis.title
        ));
        self.touch_run(run, info).await?;
        Ok(())
    }

    async fn run_evaluation_stage(
        &self,
        hypothesis: &Hypothesis,
        stage: ProcessingStatus,
    ) -> Result<(), HypoforgeError> {
        let research = hypothesis.research_output.as_deref().unwrap_or_default();
        let business = hypothesis.step3_output.as_deref().unwrap_or_default();
        let technical = hypothesis.step4_output.as_deref().unwrap_or_default();

        let prompt = match stage {
            ProcessingStatus::Step3 => render(
                &self.prompts.business_evaluation,
                &[
                    ("TITLE", hypothesis.title.as_str()),
                    ("RESEARCH_OUTPUT", research),
                    ("SCORING_FORMAT", BUSINESS_RUBRIC.format_instructions().as_str()),
                ],
            ),
            ProcessingStatus::Step4 => render(
                &self.prompts.technical_evaluation,
                &[
                    ("TITLE", hypothesis.title.as_str()),
                    ("RESEARCH_OUTPUT", research),
                    ("BUSINESS_EVALUATION", business),
                    ("SCORING_FORMAT", TECHNICAL_RUBRIC.format_instructions().as_str()),
                ],
            ),
            _ => render(
                &self.prompts.integration,
                &[
                    ("TITLE", hypothesis.title.as_str()),
                    ("RESEARCH_OUTPUT", research),
                    ("BUSINESS_EVALUATION", business),
                    ("TECHNICAL_EVALUATION", technical),
                ],
            ),
        };

        let mut data = hypothesis.full_data.clone();
        let text = match self.ai.generate_content(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                let message = format!("{stage} generation failed: {e}");
                self.mark_hypothesis_error(hypothesis, data, &message).await?;
                return Ok(());
            }
        };

        let update = match stage {
            ProcessingStatus::Step3 => {
                let outcome = parse_business_scores(&text);
                record_score_problems(
                    hypothesis,
                    &mut data,
                    BUSINESS_RUBRIC.name,
                    &outcome.errors,
                    outcome.data.check().warning(BUSINESS_RUBRIC.name),
                );
                data.business_scores = Some(outcome.data);
                HypothesisUpdate::new().step3_output(text)
            }
            ProcessingStatus::Step4 => {
                let outcome = parse_technical_scores(&text);
                record_score_problems(
                    hypothesis,
                    &mut data,
                    TECHNICAL_RUBRIC.name,
                    &outcome.errors,
                    outcome.data.check().warning(TECHNICAL_RUBRIC.name),
                );
                data.technical_scores = Some(outcome.data);
                HypothesisUpdate::new().step4_output(text)
            }
            _ => HypothesisUpdate::new()
                .step5_output(text)
                .status(ProcessingStatus::Completed),
        };

        self.store
            .update_hypothesis(hypothesis.id, update.full_data(data))
            .await?;
        info!(
            run_id = hypothesis.run_id,
            hypothesis_id = hypothesis.id,
            stage = %stage,
            "Evaluation stage finished"
        );
        Ok(())
    }

    // ── Completion ──────────────────────────────────────────────────────

    async fn complete_run(&self, run: &Run, hypotheses: &[Hypothesis]) -> Result<(), HypoforgeError> {
        let completed = hypotheses
            .iter()
            .filter(|h| h.processing_status == ProcessingStatus::Completed)
            .count();
        let failed = hypotheses.len() - completed;
        self.store
            .update_run_status(
                run.id,
                RunUpdate::new()
                    .status(RunStatus::Completed)
                    .current_step(STEP_COMPLETED)
                    .progress_info(
                        run.progress_info
                            .clone()
                            .with_message(format!("{completed} completed, {failed} failed")),
                    ),
            )
            .await?;
        info!(run_id = run.id, completed, failed, "Run completed");
        Ok(())
    }
}

fn record_score_problems(
    hypothesis: &Hypothesis,
    data: &mut HypothesisData,
    rubric: &str,
    parse_errors: &[String],
    total_warning: Option<String>,
) {
    if !parse_errors.is_empty() {
        warn!(
            hypothesis_id = hypothesis.id,
            rubric,
            errors = ?parse_errors,
            "Score report parsed with missing fields"
        );
        data.score_warnings
            .extend(parse_errors.iter().map(|e| format!("{rubric}: {e}")));
    }
    if let Some(warning) = total_warning {
        warn!(hypothesis_id = hypothesis.id, rubric, "{warning}");
        data.score_warnings.push(warning);
    }
}

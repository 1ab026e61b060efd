//! The persistence collaborator and its implementations.
//!
//! `PipelineStore` is everything the Step Executor reads and writes.
//! `SqliteStore` is the durable store shared by every process pointed at
//! the same database file. `MemoryStore` keeps state in memory behind an
//! async mutex, for tests and dry runs.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::types::{
    ExclusionFilter, Hypothesis, HypothesisData, HypothesisId, HypothesisUpdate, NewHypothesis,
    NewRun, ProcessingStatus, ProgressInfo, ProjectId, Resource, ResourceId, Run, RunId,
    RunStatus, RunUpdate, STEP_NOT_STARTED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Capability interface for reading and writing pipeline state.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    async fn get_resource(&self, id: ResourceId) -> Result<Option<Resource>, StoreError>;

    /// Apply a partial update and return the updated run.
    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> Result<Run, StoreError>;

    /// Create a batch of hypotheses. Either every entry is stored or, on
    /// error, none is.
    async fn create_hypotheses(
        &self,
        batch: Vec<NewHypothesis>,
    ) -> Result<Vec<Hypothesis>, StoreError>;

    async fn get_hypothesis(&self, id: HypothesisId) -> Result<Option<Hypothesis>, StoreError>;

    async fn update_hypothesis(
        &self,
        id: HypothesisId,
        update: HypothesisUpdate,
    ) -> Result<Hypothesis, StoreError>;

    /// Hypotheses of a run in ordinal order.
    async fn get_hypotheses_for_run(&self, run_id: RunId) -> Result<Vec<Hypothesis>, StoreError>;

    /// Hypotheses of a project matching `filter`, used to steer research
    /// away from ideas already generated. Stores that cannot answer this
    /// return nothing.
    async fn get_existing_hypotheses(
        &self,
        _project_id: ProjectId,
        _filter: &ExclusionFilter,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        Ok(Vec::new())
    }

    /// Every run, for the recovery sweep.
    async fn list_runs(&self) -> Result<Vec<Run>, StoreError>;
}

/// A freshly submitted run: pending, nothing started.
pub(crate) fn build_run(id: RunId, new: NewRun, now: DateTime<Utc>) -> Run {
    Run {
        id,
        project_id: new.project_id,
        job_name: new.job_name,
        target_spec_id: new.target_spec_id,
        technical_assets_id: new.technical_assets_id,
        hypothesis_count: new.hypothesis_count,
        status: RunStatus::Pending,
        current_step: STEP_NOT_STARTED,
        progress_info: ProgressInfo {
            exclusion_filter: new.exclusion_filter,
            ..Default::default()
        },
        research_output: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn build_hypothesis(
    id: HypothesisId,
    new: NewHypothesis,
    now: DateTime<Utc>,
) -> Hypothesis {
    Hypothesis {
        id,
        run_id: new.run_id,
        ordinal: new.ordinal,
        title: new.title,
        processing_status: ProcessingStatus::Pending,
        research_output: None,
        step3_output: None,
        step4_output: None,
        step5_output: None,
        full_data: HypothesisData {
            summary: Some(new.summary),
            ..Default::default()
        },
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_run_id: RunId,
    next_hypothesis_id: HypothesisId,
    next_resource_id: ResourceId,
    runs: BTreeMap<RunId, Run>,
    hypotheses: BTreeMap<HypothesisId, Hypothesis>,
    resources: BTreeMap<ResourceId, Resource>,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// In-memory store. State lives only as long as the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_resource(
        &self,
        project_id: ProjectId,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Resource, StoreError> {
        let mut state = self.state.lock().await;
        let resource = Resource {
            id: next_id(&mut state.next_resource_id),
            project_id,
            name: name.into(),
            content: content.into(),
        };
        state.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    /// Create a pending run, as the submission layer does.
    pub async fn create_run(&self, new: NewRun) -> Result<Run, StoreError> {
        let mut state = self.state.lock().await;
        let run = build_run(next_id(&mut state.next_run_id), new, Utc::now());
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<Resource>, StoreError> {
        Ok(self.state.lock().await.resources.get(&id).cloned())
    }

    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> Result<Run, StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound { run_id })?;
        update.apply(run, Utc::now());
        Ok(run.clone())
    }

    async fn create_hypotheses(
        &self,
        batch: Vec<NewHypothesis>,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(missing) = batch.iter().find(|new| !state.runs.contains_key(&new.run_id)) {
            return Err(StoreError::RunNotFound {
                run_id: missing.run_id,
            });
        }
        let now = Utc::now();
        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            let hypothesis = build_hypothesis(next_id(&mut state.next_hypothesis_id), new, now);
            state.hypotheses.insert(hypothesis.id, hypothesis.clone());
            created.push(hypothesis);
        }
        Ok(created)
    }

    async fn get_hypothesis(&self, id: HypothesisId) -> Result<Option<Hypothesis>, StoreError> {
        Ok(self.state.lock().await.hypotheses.get(&id).cloned())
    }

    async fn update_hypothesis(
        &self,
        id: HypothesisId,
        update: HypothesisUpdate,
    ) -> Result<Hypothesis, StoreError> {
        let mut state = self.state.lock().await;
        let hypothesis = state
            .hypotheses
            .get_mut(&id)
            .ok_or(StoreError::HypothesisNotFound { id })?;
        update.apply(hypothesis, Utc::now());
        Ok(hypothesis.clone())
    }

    async fn get_hypotheses_for_run(&self, run_id: RunId) -> Result<Vec<Hypothesis>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<Hypothesis> = state
            .hypotheses
            .values()
            .filter(|h| h.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by_key(|h| (h.ordinal, h.id));
        Ok(found)
    }

    async fn get_existing_hypotheses(
        &self,
        project_id: ProjectId,
        filter: &ExclusionFilter,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .hypotheses
            .values()
            .filter(|h| {
                state
                    .runs
                    .get(&h.run_id)
                    .is_some_and(|run| run.project_id == project_id)
            })
            .filter(|h| filter.matches(h))
            .cloned()
            .collect())
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self.state.lock().await.runs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(project_id: ProjectId) -> NewRun {
        NewRun {
            project_id,
            job_name: "thermal".into(),
            target_spec_id: 1,
            technical_assets_id: 2,
            hypothesis_count: 3,
            exclusion_filter: None,
        }
    }

    fn new_hypothesis(run_id: RunId, ordinal: u32, title: &str) -> NewHypothesis {
        NewHypothesis {
            run_id,
            ordinal,
            title: title.into(),
            summary: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_update_run() {
        let store = MemoryStore::new();
        let run = store.create_run(new_run(1)).await.unwrap();
        assert_eq!(run.id, 1);
        assert_eq!(run.status, RunStatus::Pending);

        let updated = store
            .update_run_status(run.id, RunUpdate::new().status(RunStatus::Running).current_step(1))
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.current_step, 1);
        assert!(updated.updated_at >= run.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let store = MemoryStore::new();
        let err = store.update_run_status(42, RunUpdate::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { run_id: 42 }));
    }

    #[tokio::test]
    async fn test_hypotheses_ordered_by_ordinal() {
        let store = MemoryStore::new();
        let run = store.create_run(new_run(1)).await.unwrap();
        store
            .create_hypotheses(vec![
                new_hypothesis(run.id, 2, "c"),
                new_hypothesis(run.id, 0, "a"),
                new_hypothesis(run.id, 1, "b"),
            ])
            .await
            .unwrap();
        let titles: Vec<_> = store
            .get_hypotheses_for_run(run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.title)
            .collect();
        assert_eq!(titles, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_batch_with_unknown_run_creates_nothing() {
        let store = MemoryStore::new();
        let run = store.create_run(new_run(1)).await.unwrap();
        let err = store
            .create_hypotheses(vec![new_hypothesis(run.id, 0, "a"), new_hypothesis(77, 1, "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { run_id: 77 }));
        assert!(store.get_hypotheses_for_run(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_hypotheses_scoped_to_project() {
        let store = MemoryStore::new();
        let mine = store.create_run(new_run(1)).await.unwrap();
        let other = store.create_run(new_run(2)).await.unwrap();
        store
            .create_hypotheses(vec![
                new_hypothesis(mine.id, 0, "from mine"),
                new_hypothesis(other.id, 0, "from other"),
            ])
            .await
            .unwrap();
        let found = store
            .get_existing_hypotheses(1, &ExclusionFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].run_id, mine.id);
    }
}

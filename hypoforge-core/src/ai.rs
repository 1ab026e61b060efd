//! The AI collaborator: short generation calls plus the start/poll/cleanup
//! triad for long-running deep research.
//!
//! The core only sees `AiClient`. Rate limiting, retries and transport
//! details live in the implementations under `providers`.

use crate::error::AiError;
use crate::types::DeepResearchHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A document handed to deep research as searchable context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchFile {
    pub name: String,
    pub mime_type: String,
    pub content: String,
}

impl ResearchFile {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: "text/plain".to_string(),
            content: content.into(),
        }
    }
}

/// Result of a single status check on a deep-research task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResearchPoll {
    Running,
    Completed { text: String },
    Failed { error: String },
}

/// Capability interface for content generation and deep research.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// One synchronous generation call.
    async fn generate_content(&self, prompt: &str) -> Result<String, AiError>;

    /// Submit a research task and return its handle without waiting.
    async fn start_deep_research(
        &self,
        prompt: &str,
        files: &[ResearchFile],
        store_name: &str,
    ) -> Result<DeepResearchHandle, AiError>;

    /// Cheap status check.
    async fn check_deep_research(
        &self,
        handle: &DeepResearchHandle,
    ) -> Result<ResearchPoll, AiError>;

    /// Release remote resources tied to the handle.
    async fn cleanup_deep_research(&self, handle: &DeepResearchHandle) -> Result<(), AiError>;
}

/// Transient errors worth retrying inside an adapter.
pub fn is_retryable(error: &AiError) -> bool {
    matches!(
        error,
        AiError::RateLimited { .. } | AiError::Timeout { .. } | AiError::Connection { .. }
    )
}

/// A call recorded by `MockAiClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Generate {
        prompt: String,
    },
    StartResearch {
        prompt: String,
        files: Vec<String>,
        store_name: String,
    },
    CheckResearch {
        interaction_id: String,
    },
    CleanupResearch {
        interaction_id: String,
        store_name: String,
    },
}

#[derive(Default)]
struct MockState {
    generate: VecDeque<Result<String, AiError>>,
    start_errors: VecDeque<AiError>,
    polls: HashMap<String, VecDeque<Result<ResearchPoll, AiError>>>,
    next_interaction: u64,
    calls: Vec<MockCall>,
}

/// A scripted AI client for testing and dry runs.
///
/// Generation pops queued results and falls back to a default text.
/// Research handles are named `mock-interaction-1`, `mock-interaction-2`, ...
/// in start order; polls pop the script for that interaction and fall back
/// to the default poll (completed).
pub struct MockAiClient {
    default_text: String,
    default_poll: ResearchPoll,
    state: Mutex<MockState>,
}

impl MockAiClient {
    pub fn new() -> Self {
        Self {
            default_text: "mock response".to_string(),
            default_poll: ResearchPoll::Completed {
                text: "mock research result".to_string(),
            },
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every generation call without a queued result returns `text`.
    pub fn with_response(text: &str) -> Self {
        Self {
            default_text: text.to_string(),
            ..Self::new()
        }
    }

    pub fn with_default_poll(mut self, poll: ResearchPoll) -> Self {
        self.default_poll = poll;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue_generate(&self, result: Result<String, AiError>) {
        self.state().generate.push_back(result);
    }

    pub fn queue_text(&self, text: &str) {
        self.queue_generate(Ok(text.to_string()));
    }

    /// The next `start_deep_research` call fails with `error`.
    pub fn queue_start_error(&self, error: AiError) {
        self.state().start_errors.push_back(error);
    }

    /// Script the status checks for one interaction, in order.
    pub fn script_polls(&self, interaction_id: &str, polls: Vec<Result<ResearchPoll, AiError>>) {
        self.state()
            .polls
            .entry(interaction_id.to_string())
            .or_default()
            .extend(polls);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn started_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::StartResearch { .. }))
    }

    pub fn cleanup_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::CleanupResearch { .. }))
    }

    pub fn generate_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Generate { .. }))
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| pred(call)).count()
    }
}

impl Default for MockAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiClient for MockAiClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate_content(&self, prompt: &str) -> Result<String, AiError> {
        let mut state = self.state();
        state.calls.push(MockCall::Generate {
            prompt: prompt.to_string(),
        });
        state
            .generate
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_text.clone()))
    }

    async fn start_deep_research(
        &self,
        prompt: &str,
        files: &[ResearchFile],
        store_name: &str,
    ) -> Result<DeepResearchHandle, AiError> {
        let mut state = self.state();
        state.calls.push(MockCall::StartResearch {
            prompt: prompt.to_string(),
            files: files.iter().map(|f| f.name.clone()).collect(),
            store_name: store_name.to_string(),
        });
        if let Some(error) = state.start_errors.pop_front() {
            return Err(error);
        }
        state.next_interaction += 1;
        Ok(DeepResearchHandle::new(
            format!("mock-interaction-{}", state.next_interaction),
            store_name,
        ))
    }

    async fn check_deep_research(
        &self,
        handle: &DeepResearchHandle,
    ) -> Result<ResearchPoll, AiError> {
        let mut state = self.state();
        state.calls.push(MockCall::CheckResearch {
            interaction_id: handle.interaction_id.clone(),
        });
        state
            .polls
            .get_mut(&handle.interaction_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(self.default_poll.clone()))
    }

    async fn cleanup_deep_research(&self, handle: &DeepResearchHandle) -> Result<(), AiError> {
        self.state().calls.push(MockCall::CleanupResearch {
            interaction_id: handle.interaction_id.clone(),
            store_name: handle.store_name.clone(),
        });
        Ok(())
    }
}

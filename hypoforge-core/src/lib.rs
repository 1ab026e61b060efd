//! # Hypoforge Core
//!
//! Core library for Hypoforge, a resumable pipeline that turns a target
//! specification and a description of technical assets into scored
//! business hypotheses. Provides the step executor and its phase resolver,
//! the AI and persistence collaborators, score and hypothesis extraction,
//! configuration, and the drivers that keep runs moving.

pub mod ai;
pub mod config;
pub mod error;
pub mod executor;
pub mod extraction;
pub mod phase;
pub mod prompts;
pub mod providers;
pub mod runner;
pub mod scoring;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use ai::{AiClient, MockAiClient, ResearchFile, ResearchPoll};
pub use config::{HypoforgeConfig, load_config};
pub use error::{AiError, ConfigError, HypoforgeError, PipelineError, Result, StoreError};
pub use executor::StepExecutor;
pub use phase::{Phase, next_phase};
pub use runner::{DriveReport, RecoverySweep, RunDriver};
pub use scoring::{BusinessScores, TechnicalScores, parse_business_scores, parse_technical_scores};
pub use store::{MemoryStore, PipelineStore, SqliteStore};
pub use types::{
    DeepResearchHandle, Hypothesis, HypothesisId, ProcessingStatus, ProgressInfo, Run, RunId,
    RunStatus, StepOutcome,
};

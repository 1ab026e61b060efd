//! AI provider implementations.
//!
//! Use `create_ai_client()` to instantiate the client selected by
//! `ai.provider`.

pub mod gemini;
pub mod throttle;

use crate::ai::{AiClient, MockAiClient};
use crate::config::AiConfig;
use crate::error::AiError;
use std::sync::Arc;

pub use gemini::GeminiClient;
pub use throttle::MinIntervalThrottle;

/// Create the AI client named by `config.provider`.
pub fn create_ai_client(config: &AiConfig) -> Result<Arc<dyn AiClient>, AiError> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiClient::new(config)?)),
        "mock" => Ok(Arc::new(MockAiClient::new())),
        other => Err(AiError::ApiRequest {
            message: format!("Unknown AI provider '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_client() {
        let config = AiConfig {
            provider: "mock".into(),
            ..AiConfig::default()
        };
        assert_eq!(create_ai_client(&config).unwrap().name(), "mock");
    }

    #[test]
    fn test_unknown_provider() {
        let config = AiConfig {
            provider: "openai".into(),
            ..AiConfig::default()
        };
        assert!(create_ai_client(&config).is_err());
    }
}

//! Google Gemini implementation of `AiClient`.
//!
//! Generation goes through `models/{model}:generateContent`. Deep research
//! uses the Interactions API in background mode: input documents are
//! uploaded to a file-search store, the interaction is created with that
//! store attached, and later polled by id. Cleanup deletes the store.
//!
//! Authentication is the `x-goog-api-key` header. Every outbound call first
//! waits on the adapter's `MinIntervalThrottle`.

use super::throttle::MinIntervalThrottle;
use crate::ai::{AiClient, ResearchFile, ResearchPoll, is_retryable};
use crate::config::AiConfig;
use crate::error::AiError;
use crate::types::DeepResearchHandle;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Upload operations are polled at most this many times.
const UPLOAD_POLL_ATTEMPTS: u32 = 30;
const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    agent: String,
    max_retries: usize,
    timeout_secs: u64,
    throttle: MinIntervalThrottle,
}

impl GeminiClient {
    /// Build a client, reading the key from `api_key` or `api_key_env`.
    pub fn new(config: &AiConfig) -> Result<Self, AiError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&config.api_key_env).ok())
            .ok_or_else(|| AiError::AuthFailed {
                provider: format!("Gemini (env var '{}' not set)", config.api_key_env),
            })?;
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(config: &AiConfig, api_key: String) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AiError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            agent: config.deep_research_agent.clone(),
            max_retries: config.max_retries,
            timeout_secs: config.request_timeout_secs,
            throttle: MinIntervalThrottle::new(config.min_request_interval()),
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("x-goog-api-key", &self.api_key)
    }

    /// Throttle, send, check status and parse the JSON body.
    async fn send_json(&self, request: RequestBuilder) -> Result<Value, AiError> {
        self.throttle.acquire().await;
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;
        read_json(response).await
    }

    async fn generate_once(&self, prompt: &str) -> Result<String, AiError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!(model = self.model.as_str(), "Sending Gemini generateContent request");
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        let response = self.send_json(self.client.post(&url).json(&body)).await?;
        parse_generate_response(&response)
    }

    /// Create a file-search store and upload every file into it.
    async fn create_store(&self, display_name: &str, files: &[ResearchFile]) -> Result<String, AiError> {
        let url = format!("{}/fileSearchStores", self.base_url);
        let created = self
            .send_json(self.client.post(&url).json(&json!({ "displayName": display_name })))
            .await?;
        let store = created["name"]
            .as_str()
            .ok_or_else(|| AiError::ResponseParse {
                message: "Missing 'name' in fileSearchStores response".to_string(),
            })?
            .to_string();

        for file in files {
            if let Err(e) = self.upload_file(&store, file).await {
                self.delete_store(&store).await;
                return Err(e);
            }
        }
        Ok(store)
    }

    async fn upload_file(&self, store: &str, file: &ResearchFile) -> Result<(), AiError> {
        let url = format!(
            "{}/{}:uploadToFileSearchStore",
            upload_url_for(&self.base_url),
            store
        );
        let metadata = json!({ "displayName": file.name, "mimeType": file.mime_type });
        let form = reqwest::multipart::Form::new()
            .part(
                "metadata",
                reqwest::multipart::Part::text(metadata.to_string())
                    .mime_str("application/json")
                    .map_err(request_build_error)?,
            )
            .part(
                "file",
                reqwest::multipart::Part::bytes(file.content.clone().into_bytes())
                    .file_name(file.name.clone())
                    .mime_str(&file.mime_type)
                    .map_err(request_build_error)?,
            );

        let mut operation = self
            .send_json(self.client.post(&url).multipart(form))
            .await?;
        let mut attempts = 0;
        while !operation["done"].as_bool().unwrap_or(false) {
            attempts += 1;
            if attempts > UPLOAD_POLL_ATTEMPTS {
                return Err(AiError::ApiRequest {
                    message: format!("Upload of '{}' did not finish", file.name),
                });
            }
            let Some(name) = operation["name"].as_str() else {
                break;
            };
            tokio::time::sleep(UPLOAD_POLL_INTERVAL).await;
            let url = format!("{}/{}", self.base_url, name);
            operation = self.send_json(self.client.get(&url)).await?;
        }
        if let Some(error) = operation.get("error") {
            return Err(AiError::ApiRequest {
                message: format!("Upload of '{}' failed: {error}", file.name),
            });
        }
        debug!(store, file = file.name.as_str(), "Uploaded research file");
        Ok(())
    }

    /// Best-effort store deletion; failures are logged.
    async fn delete_store(&self, store: &str) {
        let url = format!("{}/{}?force=true", self.base_url, store);
        if let Err(e) = self.send_json(self.client.delete(&url)).await {
            warn!(store, error = %e, "Failed to delete file-search store");
        }
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate_content(&self, prompt: &str) -> Result<String, AiError> {
        let mut attempt = 0;
        loop {
            match self.generate_once(prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if is_retryable(&e) && attempt < self.max_retries => {
                    let backoff_secs = std::cmp::min(1u64 << attempt, 32);
                    let wait = match &e {
                        AiError::RateLimited { retry_after_secs } => {
                            std::cmp::max(*retry_after_secs, backoff_secs)
                        }
                        _ => backoff_secs,
                    };
                    info!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        backoff_secs = wait,
                        error = %e,
                        "Retrying Gemini generation after transient error"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn start_deep_research(
        &self,
        prompt: &str,
        files: &[ResearchFile],
        store_name: &str,
    ) -> Result<DeepResearchHandle, AiError> {
        let store = if files.is_empty() {
            None
        } else {
            Some(self.create_store(store_name, files).await?)
        };

        let url = format!("{}/interactions", self.base_url);
        let body = interaction_request_body(&self.agent, prompt, store.as_deref());
        let created = self
            .send_json(self.client.post(&url).json(&body))
            .await
            .and_then(|created| {
                created["id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| AiError::ResponseParse {
                        message: "Missing 'id' in interactions response".to_string(),
                    })
            });
        let interaction_id = match created {
            Ok(id) => id,
            Err(e) => {
                if let Some(store) = &store {
                    self.delete_store(store).await;
                }
                return Err(e);
            }
        };

        info!(
            interaction_id = interaction_id.as_str(),
            store = store.as_deref().unwrap_or(""),
            "Started deep research"
        );
        Ok(DeepResearchHandle::new(
            interaction_id,
            store.unwrap_or_default(),
        ))
    }

    async fn check_deep_research(
        &self,
        handle: &DeepResearchHandle,
    ) -> Result<ResearchPoll, AiError> {
        let url = format!("{}/interactions/{}", self.base_url, handle.interaction_id);
        let body = self.send_json(self.client.get(&url)).await?;
        Ok(parse_interaction_status(&body))
    }

    async fn cleanup_deep_research(&self, handle: &DeepResearchHandle) -> Result<(), AiError> {
        if !handle.store_name.is_empty() {
            self.delete_store(&handle.store_name).await;
        }
        Ok(())
    }
}

async fn read_json(response: Response) -> Result<Value, AiError> {
    let status = response.status();
    let body_text = response.text().await.map_err(|e| AiError::ResponseParse {
        message: format!("Failed to read response body: {e}"),
    })?;
    if !status.is_success() {
        return Err(map_http_error(status, &body_text));
    }
    if body_text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body_text).map_err(|e| AiError::ResponseParse {
        message: format!("Invalid JSON in response: {e}"),
    })
}

fn request_build_error(e: reqwest::Error) -> AiError {
    AiError::ApiRequest {
        message: format!("Failed to build request: {e}"),
    }
}

fn map_transport_error(e: reqwest::Error, timeout_secs: u64) -> AiError {
    if e.is_timeout() {
        AiError::Timeout { timeout_secs }
    } else if e.is_connect() {
        AiError::Connection {
            message: e.to_string(),
        }
    } else {
        AiError::ApiRequest {
            message: format!("Request to Gemini API failed: {e}"),
        }
    }
}

/// Map a non-success HTTP status to an error.
pub fn map_http_error(status: reqwest::StatusCode, body_text: &str) -> AiError {
    match status.as_u16() {
        401 | 403 => AiError::AuthFailed {
            provider: "Gemini".to_string(),
        },
        429 => AiError::RateLimited {
            retry_after_secs: 30,
        },
        _ => AiError::ApiRequest {
            message: format!("HTTP {status} from Gemini API: {body_text}"),
        },
    }
}

/// `https://host/v1beta` → `https://host/upload/v1beta`.
pub fn upload_url_for(base_url: &str) -> String {
    let Some(scheme_end) = base_url.find("://") else {
        return format!("upload/{base_url}");
    };
    let host_start = scheme_end + 3;
    match base_url[host_start..].find('/') {
        Some(offset) => {
            let split = host_start + offset;
            format!("{}/upload{}", &base_url[..split], &base_url[split..])
        }
        None => format!("{base_url}/upload"),
    }
}

pub fn interaction_request_body(agent: &str, prompt: &str, store: Option<&str>) -> Value {
    let mut body = json!({
        "agent": agent,
        "input": prompt,
        "background": true,
    });
    if let Some(store) = store {
        body["tools"] = json!([{
            "type": "file_search",
            "file_search_store_names": [store],
        }]);
    }
    body
}

/// Concatenate the text parts of the first candidate.
pub fn parse_generate_response(body: &Value) -> Result<String, AiError> {
    let candidates = body["candidates"]
        .as_array()
        .ok_or_else(|| AiError::ResponseParse {
            message: "Missing 'candidates' array in response".to_string(),
        })?;
    let candidate = candidates.first().ok_or_else(|| AiError::ResponseParse {
        message: "Empty 'candidates' array in response".to_string(),
    })?;
    let parts = candidate["content"]["parts"]
        .as_array()
        .ok_or_else(|| AiError::ResponseParse {
            message: "Missing 'parts' array in candidate content".to_string(),
        })?;
    Ok(parts
        .iter()
        .filter(|part| !part["thought"].as_bool().unwrap_or(false))
        .filter_map(|part| part["text"].as_str())
        .collect::<Vec<_>>()
        .join(""))
}

/// Map an interaction resource to a poll result. A completed interaction
/// yields the text of its last text output.
pub fn parse_interaction_status(body: &Value) -> ResearchPoll {
    let status = body["status"].as_str().unwrap_or("in_progress");
    match status {
        "completed" => {
            let text = body["outputs"]
                .as_array()
                .and_then(|outputs| {
                    outputs
                        .iter()
                        .rev()
                        .find_map(|output| output["text"].as_str())
                })
                .unwrap_or_default()
                .to_string();
            ResearchPoll::Completed { text }
        }
        "failed" | "cancelled" => ResearchPoll::Failed {
            error: body["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("interaction {status}")),
        },
        _ => ResearchPoll::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_without_key_fails() {
        let config = AiConfig {
            api_key_env: "HYPOFORGE_TEST_UNSET_GEMINI_KEY".to_string(),
            ..AiConfig::default()
        };
        let err = GeminiClient::new(&config).err().unwrap();
        assert!(matches!(err, AiError::AuthFailed { .. }));
    }

    #[test]
    fn test_inline_key_and_base_url() {
        let config = AiConfig {
            api_key: Some("k".into()),
            base_url: Some("http://localhost:9000/v1beta/".into()),
            ..AiConfig::default()
        };
        let client = GeminiClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000/v1beta");
        assert_eq!(client.name(), "gemini");
    }

    #[test]
    fn test_map_http_error() {
        assert!(matches!(
            map_http_error(reqwest::StatusCode::FORBIDDEN, ""),
            AiError::AuthFailed { .. }
        ));
        assert!(matches!(
            map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            AiError::RateLimited {
                retry_after_secs: 30
            }
        ));
        let err = map_http_error(reqwest::StatusCode::BAD_REQUEST, "bad field");
        assert!(err.to_string().contains("bad field"));
    }

    #[test]
    fn test_upload_url() {
        assert_eq!(
            upload_url_for(DEFAULT_BASE_URL),
            "https://generativelanguage.googleapis.com/upload/v1beta"
        );
        assert_eq!(upload_url_for("http://host"), "http://host/upload");
    }

    #[test]
    fn test_interaction_body_with_store() {
        let body = interaction_request_body("agent-x", "research this", Some("fileSearchStores/s1"));
        assert_eq!(body["agent"], "agent-x");
        assert_eq!(body["background"], true);
        assert_eq!(body["tools"][0]["file_search_store_names"][0], "fileSearchStores/s1");

        let bare = interaction_request_body("agent-x", "p", None);
        assert!(bare.get("tools").is_none());
    }

    #[test]
    fn test_parse_generate_response() {
        let body = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "thinking...", "thought": true },
                    { "text": "Hello, " },
                    { "text": "world" }
                ]}
            }]
        });
        assert_eq!(parse_generate_response(&body).unwrap(), "Hello, world");
        assert!(parse_generate_response(&json!({ "candidates": [] })).is_err());
        assert!(parse_generate_response(&json!({})).is_err());
    }

    #[test]
    fn test_parse_interaction_status() {
        assert_eq!(
            parse_interaction_status(&json!({ "status": "in_progress" })),
            ResearchPoll::Running
        );
        assert_eq!(
            parse_interaction_status(&json!({
                "status": "completed",
                "outputs": [{ "type": "thought" }, { "type": "text", "text": "final report" }]
            })),
            ResearchPoll::Completed {
                text: "final report".into()
            }
        );
        assert_eq!(
            parse_interaction_status(&json!({ "status": "failed", "error": { "message": "quota" } })),
            ResearchPoll::Failed {
                error: "quota".into()
            }
        );
        assert_eq!(
            parse_interaction_status(&json!({ "status": "cancelled" })),
            ResearchPoll::Failed {
                error: "interaction cancelled".into()
            }
        );
    }
}

//! Client for the external hook service.
//!
//! A thin request/response client over HTTP. Hooks observe and transform
//! the orchestration pipeline at four stages: `submit`, `pre_delegation`,
//! `post_delegation`, and `ticket_extraction`. Hook calls never raise:
//! transport failures are logged and reported as an empty result list, so
//! the orchestrator proceeds as if the stage was a no-op.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Default hook service URL when `CLAUDE_MPM_HOOKS_URL` is unset.
pub const DEFAULT_HOOKS_URL: &str = "http://localhost:5001";

/// Request timeout for all hook calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry attempts for retryable HTTP statuses and connection errors.
const RETRY_ATTEMPTS: u32 = 3;

/// Base backoff between retries; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The closed set of hook stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    Submit,
    PreDelegation,
    PostDelegation,
    TicketExtraction,
}

impl HookStage {
    /// Wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            HookStage::Submit => "submit",
            HookStage::PreDelegation => "pre_delegation",
            HookStage::PostDelegation => "post_delegation",
            HookStage::TicketExtraction => "ticket_extraction",
        }
    }
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hook's execution result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookResult {
    /// Whether the hook ran successfully.
    #[serde(default)]
    pub success: bool,
    /// Whether the hook modified its input.
    #[serde(default)]
    pub modified: bool,
    /// Modified/extracted data. May carry a `tickets` array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Prompt rewrite, when a hook replaces the whole prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_prompt: Option<String>,
    /// Any extra fields the hook returned.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Client for the centralized hook service.
#[derive(Debug, Clone)]
pub struct HookServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HookServiceClient {
    /// Create a client against the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { base_url, client }
    }

    /// Create a client from `CLAUDE_MPM_HOOKS_URL`, falling back to
    /// [`DEFAULT_HOOKS_URL`].
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("CLAUDE_MPM_HOOKS_URL").unwrap_or_else(|_| DEFAULT_HOOKS_URL.to_string());
        Self::new(base_url)
    }

    /// Base URL the client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`. Unreachable services report `status: "unhealthy"`.
    pub async fn health_check(&self) -> Value {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.json().await.unwrap_or_else(|err| {
                    json!({"status": "unhealthy", "error": err.to_string()})
                }),
                Err(err) => json!({"status": "unhealthy", "error": err.to_string()}),
            },
            Err(err) => {
                log::error!("Health check failed: {err}");
                json!({"status": "unhealthy", "error": err.to_string()})
            }
        }
    }

    /// `GET /hooks/list`: registered hooks grouped by stage.
    pub async fn list_hooks(&self) -> Map<String, Value> {
        let url = format!("{}/hooks/list", self.base_url);
        let result: Result<Value, reqwest::Error> = async {
            let response = self.client.get(&url).send().await?.error_for_status()?;
            response.json().await
        }
        .await;

        match result {
            Ok(value) => value
                .get("hooks")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            Err(err) => {
                log::error!("Failed to list hooks: {err}");
                Map::new()
            }
        }
    }

    /// `POST /hooks/execute` for one stage.
    ///
    /// Retries on 429/5xx and connection errors with exponential backoff.
    /// Never returns an error: any terminal failure yields `[]`.
    pub async fn execute_hook(
        &self,
        stage: HookStage,
        context: Value,
        metadata: Option<Value>,
        hook_name: Option<&str>,
    ) -> Vec<HookResult> {
        let url = format!("{}/hooks/execute", self.base_url);
        let mut payload = json!({
            "hook_type": stage.as_str(),
            "context": context,
            "metadata": metadata.unwrap_or_else(|| json!({})),
        });
        if let Some(name) = hook_name {
            payload["hook_name"] = json!(name);
        }

        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF * 2_u32.pow(attempt - 1)).await;
            }

            let response = match self.client.post(&url).json(&payload).send().await {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("Hook execute attempt {} failed: {err}", attempt + 1);
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                log::warn!("Hook service returned {status}, retrying");
                continue;
            }
            if !status.is_success() {
                log::error!("Hook execution failed with status {status}");
                return Vec::new();
            }

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    log::error!("Failed to parse hook response: {err}");
                    return Vec::new();
                }
            };

            if body.get("status").and_then(Value::as_str) == Some("success") {
                let results = body.get("results").cloned().unwrap_or(json!([]));
                return serde_json::from_value(results).unwrap_or_default();
            }

            log::error!(
                "Hook execution failed: {}",
                body.get("error").and_then(Value::as_str).unwrap_or("unknown error")
            );
            return Vec::new();
        }

        log::warn!("Hook service unreachable after {RETRY_ATTEMPTS} attempts, treating {stage} as no-op");
        Vec::new()
    }

    /// Run `submit` hooks on a user prompt.
    pub async fn execute_submit_hook(&self, prompt: &str, extra: Value) -> Vec<HookResult> {
        let mut context = json!({"prompt": prompt});
        merge_object(&mut context, extra);
        self.execute_hook(HookStage::Submit, context, None, None).await
    }

    /// Run `pre_delegation` hooks for an agent about to be spawned.
    pub async fn execute_pre_delegation_hook(&self, agent: &str, context: Value) -> Vec<HookResult> {
        self.execute_hook(
            HookStage::PreDelegation,
            json!({"agent": agent, "context": context}),
            None,
            None,
        )
        .await
    }

    /// Run `post_delegation` hooks over an agent's result.
    pub async fn execute_post_delegation_hook(&self, agent: &str, result: Value) -> Vec<HookResult> {
        self.execute_hook(
            HookStage::PostDelegation,
            json!({"agent": agent, "result": result}),
            None,
            None,
        )
        .await
    }

    /// Run `ticket_extraction` hooks over a line or block of content.
    pub async fn execute_ticket_extraction_hook(&self, content: Value) -> Vec<HookResult> {
        self.execute_hook(HookStage::TicketExtraction, json!({"content": content}), None, None)
            .await
    }

    /// Merge every modified result's `data` into one map; later wins.
    pub fn get_modified_data(results: &[HookResult]) -> Map<String, Value> {
        let mut merged = Map::new();
        for result in results {
            if result.modified {
                if let Some(data) = &result.data {
                    for (key, value) in data {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        merged
    }

    /// Flatten every successful result's `data.tickets` array.
    pub fn get_extracted_tickets(results: &[HookResult]) -> Vec<Value> {
        let mut tickets = Vec::new();
        for result in results {
            if !result.success {
                continue;
            }
            if let Some(Value::Array(found)) = result.data.as_ref().and_then(|d| d.get("tickets")) {
                tickets.extend(found.iter().cloned());
            }
        }
        tickets
    }
}

fn merge_object(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        for (key, value) in extra {
            target.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_execute_hook_returns_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/execute"))
            .and(body_partial_json(json!({"hook_type": "submit"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "results": [{"success": true, "modified": false}]
            })))
            .mount(&server)
            .await;

        let client = HookServiceClient::new(server.uri());
        let results = client.execute_submit_hook("hello", json!({})).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_connection_error_yields_empty_results() {
        // Port 1 is never listening.
        let client = HookServiceClient::new("http://127.0.0.1:1");
        let results = client
            .execute_hook(HookStage::PreDelegation, json!({}), None, None)
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_yields_empty_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/execute"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = HookServiceClient::new(server.uri());
        let results = client
            .execute_hook(HookStage::Submit, json!({}), None, None)
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_service_level_error_yields_empty_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "error": "boom"
            })))
            .mount(&server)
            .await;

        let client = HookServiceClient::new(server.uri());
        let results = client
            .execute_hook(HookStage::Submit, json!({}), None, None)
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let client = HookServiceClient::new("http://127.0.0.1:1");
        let health = client.health_check().await;
        assert_eq!(health["status"], "unhealthy");
    }

    #[test]
    fn test_get_modified_data_later_wins() {
        let results = vec![
            HookResult {
                success: true,
                modified: true,
                data: Some(
                    json!({"task": "first", "extra": 1}).as_object().unwrap().clone(),
                ),
                ..HookResult::default()
            },
            HookResult {
                success: true,
                modified: true,
                data: Some(json!({"task": "second"}).as_object().unwrap().clone()),
                ..HookResult::default()
            },
            HookResult {
                success: true,
                modified: false,
                data: Some(json!({"task": "ignored"}).as_object().unwrap().clone()),
                ..HookResult::default()
            },
        ];

        let merged = HookServiceClient::get_modified_data(&results);
        assert_eq!(merged["task"], "second");
        assert_eq!(merged["extra"], 1);
    }

    #[test]
    fn test_get_extracted_tickets_flattens_successful_results() {
        let results = vec![
            HookResult {
                success: true,
                data: Some(
                    json!({"tickets": [{"type": "bug", "title": "a"}]})
                        .as_object()
                        .unwrap()
                        .clone(),
                ),
                ..HookResult::default()
            },
            HookResult {
                success: false,
                data: Some(
                    json!({"tickets": [{"type": "bug", "title": "dropped"}]})
                        .as_object()
                        .unwrap()
                        .clone(),
                ),
                ..HookResult::default()
            },
        ];

        let tickets = HookServiceClient::get_extracted_tickets(&results);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0]["title"], "a");
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let client = HookServiceClient::new("http://localhost:5001/");
        assert_eq!(client.base_url(), "http://localhost:5001");
    }
}

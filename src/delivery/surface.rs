use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::error::{ErrorContext, RelayError, Result};
use crate::models::ActionElement;

// ============================================================================
// Surface Contract
// ============================================================================

/// A conversation surface that supports live messages: start, append*, stop.
#[async_trait]
pub trait LiveMessageSurface: Send + Sync {
    /// Open a live message and return its platform-assigned id.
    async fn start(
        &self,
        channel: &str,
        thread: Option<&str>,
        initial_text: Option<&str>,
    ) -> Result<String>;

    async fn append(&self, channel: &str, resource_id: &str, text: &str) -> Result<()>;

    async fn stop(
        &self,
        channel: &str,
        resource_id: &str,
        final_text: Option<&str>,
        actions: &[ActionElement],
    ) -> Result<()>;
}

// ============================================================================
// HTTP Surface (Slack-style Web API)
// ============================================================================

#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    pub api_url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SurfaceResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpSurface {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl HttpSurface {
    pub fn new(config: &SurfaceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building surface HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn call(&self, method: &str, body: Value) -> Result<SurfaceResponse> {
        let url = format!("{}/{}", self.api_url, method);
        log::debug!("📡 {} {}", method, body);

        let response: SurfaceResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context(format!("{} request", method))?
            .error_for_status()
            .context(format!("{} status", method))?
            .json()
            .await
            .context(format!("{} response", method))?;

        if !response.ok {
            return Err(RelayError::delivery(format!(
                "{} rejected: {}",
                method,
                response.error.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(response)
    }

    /// Lay the action elements out as one row of link buttons.
    fn action_blocks(actions: &[ActionElement]) -> Value {
        let buttons: Vec<Value> = actions
            .iter()
            .map(|a| {
                json!({
                    "type": "button",
                    "text": { "type": "plain_text", "text": a.text, "emoji": true },
                    "url": a.url,
                    "action_id": a.action_id,
                })
            })
            .collect();
        json!([{ "type": "actions", "elements": buttons }])
    }
}

#[async_trait]
impl LiveMessageSurface for HttpSurface {
    async fn start(
        &self,
        channel: &str,
        thread: Option<&str>,
        initial_text: Option<&str>,
    ) -> Result<String> {
        let mut body = Map::new();
        body.insert("channel".into(), channel.into());
        if let Some(thread) = thread {
            body.insert("thread_ts".into(), thread.into());
        }
        if let Some(text) = initial_text.filter(|t| !t.is_empty()) {
            body.insert("markdown_text".into(), text.into());
        }

        let response = self.call("chat.startStream", Value::Object(body)).await?;
        response
            .ts
            .ok_or_else(|| RelayError::delivery("chat.startStream returned no ts"))
    }

    async fn append(&self, channel: &str, resource_id: &str, text: &str) -> Result<()> {
        self.call(
            "chat.appendStream",
            json!({ "channel": channel, "ts": resource_id, "markdown_text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn stop(
        &self,
        channel: &str,
        resource_id: &str,
        final_text: Option<&str>,
        actions: &[ActionElement],
    ) -> Result<()> {
        let mut body = Map::new();
        body.insert("channel".into(), channel.into());
        body.insert("ts".into(), resource_id.into());
        if let Some(text) = final_text.filter(|t| !t.is_empty()) {
            body.insert("markdown_text".into(), text.into());
        }
        if !actions.is_empty() {
            body.insert(
                "blocks".into(),
                Self::action_blocks(actions).to_string().into(),
            );
        }

        self.call("chat.stopStream", Value::Object(body))
            .await
            .map(|_| ())
    }
}

// ============================================================================
// Recording surface for tests
// ============================================================================

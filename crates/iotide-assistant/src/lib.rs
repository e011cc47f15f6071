//! # IoT IDE Assistant
//!
//! Client for the coding assistant. The assistant itself runs remotely as
//! an HTTP function accepting `{message, context}` and answering with
//! either `{response}` or `{error}`; this crate only speaks that contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Context used when the caller has none (no file open).
pub const DEFAULT_CONTEXT: &str = "Working on an IoT project";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl AssistantRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), context: None }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Context of the form sent by the editor for the active file.
    pub fn with_file_context(self, file_name: &str, content: &str) -> Self {
        self.with_context(format!("Current file: {}\n\n{}", file_name, content))
    }
}

/// Body returned by the function: exactly one of the fields is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("Message is required")]
    EmptyMessage,

    #[error("Assistant request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Assistant returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Assistant error: {0}")]
    Remote(String),

    #[error("Invalid assistant reply: {0}")]
    Decode(#[from] serde_json::Error),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn ask(&self, request: &AssistantRequest) -> Result<String, AssistantError>;
}

/// Posts requests as JSON to a fixed endpoint.
pub struct HttpAssistant {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAssistant {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn ask(&self, request: &AssistantRequest) -> Result<String, AssistantError> {
        validate(request)?;
        log::debug!("Assistant request ({} chars) to {}", request.message.len(), self.endpoint);

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status >= 400 {
            log::warn!("Assistant returned status {}", status);
        }
        parse_reply(status, &body)
    }
}

/// Reject requests the function would refuse anyway.
pub fn validate(request: &AssistantRequest) -> Result<(), AssistantError> {
    if request.message.trim().is_empty() {
        return Err(AssistantError::EmptyMessage);
    }
    Ok(())
}

/// Interpret a status code and raw body from the function.
pub fn parse_reply(status: u16, body: &str) -> Result<String, AssistantError> {
    let success = (200..300).contains(&status);
    let reply: AssistantReply = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(_) if !success => {
            return Err(AssistantError::Status { status, message: body.trim().to_string() })
        }
        Err(e) => return Err(AssistantError::Decode(e)),
    };

    match (success, reply.response, reply.error) {
        (true, Some(text), _) => Ok(text),
        (true, None, Some(err)) => Err(AssistantError::Remote(err)),
        (true, None, None) => Err(AssistantError::Remote("Empty reply".to_string())),
        (false, _, Some(err)) => Err(AssistantError::Status { status, message: err }),
        (false, _, None) => Err(AssistantError::Status {
            status,
            message: "Unknown error".to_string(),
        }),
    }
}

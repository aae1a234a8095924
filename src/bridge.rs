//! Chat-platform bridge: message delivery and network queries.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge request: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bridge replied {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no bridge configured")]
    Unconfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    Channel,
    User,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message<'a> {
    pub target: MessageTarget,
    pub id: &'a str,
    pub content: &'a str,
    pub format: &'a str,
}

#[async_trait]
pub trait Bridge: Send + Sync {
    async fn send_message(&self, message: &Message<'_>) -> Result<(), BridgeError>;

    /// Forward an informational query, e.g. `NetworkInfo.GetUserInfo`.
    async fn query(&self, method: &str, params: &Value) -> Result<Value, BridgeError>;
}

pub struct HttpBridge {
    client: reqwest::Client,
    base: String,
}

impl HttpBridge {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value, BridgeError> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Bridge for HttpBridge {
    async fn send_message(&self, message: &Message<'_>) -> Result<(), BridgeError> {
        self.post("messages", message).await?;
        Ok(())
    }

    async fn query(&self, method: &str, params: &Value) -> Result<Value, BridgeError> {
        self.post(&format!("query/{method}"), params).await
    }
}

/// Used when no bridge address is configured: messages are logged and
/// queries fail.
pub struct LogBridge;

#[async_trait]
impl Bridge for LogBridge {
    async fn send_message(&self, message: &Message<'_>) -> Result<(), BridgeError> {
        info!(target_kind = ?message.target, id = message.id, format = message.format,
              len = message.content.len(), "message (no bridge)");
        Ok(())
    }

    async fn query(&self, _method: &str, _params: &Value) -> Result<Value, BridgeError> {
        Err(BridgeError::Unconfigured)
    }
}

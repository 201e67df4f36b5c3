//! Where sessions live and messages are sent.

use crate::auth::AuthGateway;
use crate::config::ClientConfig;
use crate::envelope;
use crate::error::AtelierError;
use crate::request::ApiRequest;
use crate::task::TaskKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A message on its way to the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutgoingMessage {
    pub prompt: String,
    #[serde(rename = "image_url", skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    /// Backend message ids this message replies to.
    #[serde(rename = "selected_messages", skip_serializing_if = "Vec::is_empty")]
    pub reply_to: Vec<String>,
}

/// A job the backend started to produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedTask {
    pub task_id: String,
    pub kind: TaskKind,
}

/// The backend's immediate answer to a message.
#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub message_id: Option<String>,
    pub content: Option<String>,
    /// Set when the reply is produced asynchronously.
    pub task: Option<LinkedTask>,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Opens a session and returns its id.
    async fn create_session(&self) -> Result<String, AtelierError>;

    async fn post_message(
        &self,
        session_id: &str,
        message: &OutgoingMessage,
    ) -> Result<ChatReply, AtelierError>;
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostedMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    feature: Option<String>,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    user_id: String,
    #[serde(flatten)]
    message: &'a OutgoingMessage,
}

/// The chat service behind `POST {chat_prefix}`.
pub struct HttpChatBackend {
    gateway: Arc<AuthGateway>,
    url: String,
}

impl HttpChatBackend {
    pub fn new(gateway: Arc<AuthGateway>, config: &ClientConfig) -> Self {
        Self {
            gateway,
            url: config.chat_url(),
        }
    }

    fn user_id(&self) -> String {
        self.gateway
            .user_id()
            .unwrap_or_else(|| "anonymous".to_string())
    }
}

#[async_trait]
impl SessionBackend for HttpChatBackend {
    async fn create_session(&self) -> Result<String, AtelierError> {
        let req = ApiRequest::post(self.url.clone())
            .json(&serde_json::json!({ "user_id": self.user_id() }))?;
        let resp = self.gateway.send(req).await?;
        let env = envelope::parse::<CreatedSession>(&resp)?;

        env.result
            .and_then(|r| r.session_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AtelierError::ResponseFormatError {
                message: "no session id in response".to_string(),
                raw_response: String::from_utf8_lossy(resp.body()).into_owned(),
            })
    }

    async fn post_message(
        &self,
        session_id: &str,
        message: &OutgoingMessage,
    ) -> Result<ChatReply, AtelierError> {
        let url = format!("{}/{}/messages", self.url.trim_end_matches('/'), session_id);
        let body = MessageBody {
            user_id: self.user_id(),
            message,
        };
        let resp = self.gateway.send(ApiRequest::post(url).json(&body)?).await?;
        let env = envelope::parse::<PostedMessage>(&resp)?;
        if !env.is_ok() {
            return Err(AtelierError::SubmissionRejected(
                env.message.unwrap_or_else(|| "message was not accepted".into()),
            ));
        }

        let Some(posted) = env.result else {
            return Ok(ChatReply::default());
        };
        // Chat jobs without an explicit feature are image generations.
        let task = posted.task_id.filter(|id| !id.is_empty()).map(|task_id| LinkedTask {
            task_id,
            kind: posted
                .feature
                .as_deref()
                .map(TaskKind::from_path)
                .unwrap_or(TaskKind::ImageGeneration),
        });
        Ok(ChatReply {
            message_id: posted.message_id,
            content: posted.content,
            task,
        })
    }
}

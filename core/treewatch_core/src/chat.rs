//! Outbound side of the chat platform: sending, deleting and listing channel messages.

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::debug;

pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat client disabled (no bot token)")]
    Disabled,
    #[error("chat transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat api returned http {0}")]
    Status(u16),
    #[error("chat api response not understood: {0}")]
    Decode(String),
}

/// Enough to find a sent message again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecentMessage {
    pub handle: MessageHandle,
    /// Authored by this bot.
    pub own: bool,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message(&self, channel_id: &str, content: &str)
        -> Result<MessageHandle, ChatError>;

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), ChatError>;

    /// Newest first, at most `limit`.
    async fn recent_messages(
        &self,
        channel_id: &str,
        limit: u8,
    ) -> Result<Vec<RecentMessage>, ChatError>;
}

#[derive(Deserialize)]
struct ApiAuthor {
    id: String,
}

#[derive(Deserialize)]
struct ApiMessage {
    id: String,
    channel_id: String,
    timestamp: String,
    #[serde(default)]
    author: Option<ApiAuthor>,
}

impl ApiMessage {
    fn handle(&self) -> Result<MessageHandle, ChatError> {
        let created_at = OffsetDateTime::parse(&self.timestamp, &Rfc3339)
            .map_err(|e| ChatError::Decode(format!("timestamp `{}`: {e}", self.timestamp)))?;
        Ok(MessageHandle {
            channel_id: self.channel_id.clone(),
            message_id: self.id.clone(),
            created_at,
        })
    }
}

#[derive(Serialize)]
struct CreateMessage<'a> {
    content: &'a str,
}

/// Discord REST client. Without a token every call fails with `ChatError::Disabled`.
pub struct DiscordRest {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
    self_id: OnceCell<String>,
}

impl DiscordRest {
    pub fn new(api_base: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            self_id: OnceCell::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ChatError> {
        let token = self.token.as_deref().ok_or(ChatError::Disabled)?;
        Ok(self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .header(header::AUTHORIZATION, format!("Bot {token}")))
    }

    async fn self_id(&self) -> Result<&str, ChatError> {
        let id = self
            .self_id
            .get_or_try_init(|| async {
                let res = self.request(reqwest::Method::GET, "/users/@me")?.send().await?;
                if !res.status().is_success() {
                    return Err(ChatError::Status(res.status().as_u16()));
                }
                let me: ApiAuthor = res.json().await?;
                Ok::<_, ChatError>(me.id)
            })
            .await?;
        Ok(id.as_str())
    }
}

#[async_trait]
impl ChatClient for DiscordRest {
    async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageHandle, ChatError> {
        let res = self
            .request(
                reqwest::Method::POST,
                &format!("/channels/{channel_id}/messages"),
            )?
            .json(&CreateMessage { content })
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ChatError::Status(res.status().as_u16()));
        }
        let msg: ApiMessage = res.json().await?;
        msg.handle()
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), ChatError> {
        let res = self
            .request(
                reqwest::Method::DELETE,
                &format!(
                    "/channels/{}/messages/{}",
                    handle.channel_id, handle.message_id
                ),
            )?
            .send()
            .await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            // Already gone.
            StatusCode::NOT_FOUND => {
                debug!(message_id = %handle.message_id, "delete: message not found");
                Ok(())
            }
            s => Err(ChatError::Status(s.as_u16())),
        }
    }

    async fn recent_messages(
        &self,
        channel_id: &str,
        limit: u8,
    ) -> Result<Vec<RecentMessage>, ChatError> {
        let self_id = self.self_id().await?.to_string();
        let res = self
            .request(
                reqwest::Method::GET,
                &format!("/channels/{channel_id}/messages?limit={}", limit.clamp(1, 100)),
            )?
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(ChatError::Status(res.status().as_u16()));
        }
        let messages: Vec<ApiMessage> = res.json().await?;
        messages
            .iter()
            .map(|m| {
                Ok(RecentMessage {
                    handle: m.handle()?,
                    own: m.author.as_ref().is_some_and(|a| a.id == self_id),
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_fails_softly() {
        let client = DiscordRest::new(DEFAULT_DISCORD_API_BASE, Some("  ".to_string()));
        assert!(!client.is_enabled());
        let err = client.send_message("1", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Disabled));
        let err = client.recent_messages("1", 10).await.unwrap_err();
        assert!(matches!(err, ChatError::Disabled));
    }

    #[test]
    fn api_message_decodes_handle() {
        let msg: ApiMessage = serde_json::from_str(
            r#"{"id":"9","channel_id":"5","timestamp":"2025-01-01T10:00:00.123000+00:00","author":{"id":"7"}}"#,
        )
        .unwrap();
        let handle = msg.handle().unwrap();
        assert_eq!(handle.message_id, "9");
        assert_eq!(handle.channel_id, "5");
        assert_eq!(handle.created_at.hour(), 10);

        let bad: ApiMessage =
            serde_json::from_str(r#"{"id":"9","channel_id":"5","timestamp":"yesterday"}"#)
                .unwrap();
        assert!(matches!(bad.handle(), Err(ChatError::Decode(_))));
    }

    #[test]
    fn api_base_is_trimmed() {
        let client = DiscordRest::new("http://localhost:9/api/", Some("t".to_string()));
        assert_eq!(client.api_base, "http://localhost:9/api");
        assert!(client.is_enabled());
    }
}

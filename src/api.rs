//! Companion REST endpoints of the chat channel.
//!
//! History paging, conversation summaries and the attachment upload handshake
//! go over HTTP rather than the real-time connection. The [`ChatApi`] trait is
//! what the client depends on; [`HttpChatApi`] is the `reqwest` implementation
//! behind the `rest-api` feature.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::chat::{ConversationSummary, HistoryPage, UploadTarget};

/// Connection details for the REST endpoints.
///
/// ```
/// use lobbylink_client::api::ApiConfig;
///
/// let config = ApiConfig::new("https://play.example.com/api/").with_bearer_token("t0k3n");
/// assert_eq!(config.base_url, "https://play.example.com/api");
/// ```
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub bearer_token: Option<String>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            bearer_token: None,
        }
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// REST operations the chat engine needs.
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    /// One page of history older than `before` (newest page when `None`).
    async fn fetch_history(
        &self,
        friend_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage>;

    /// Every conversation of the local user.
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>>;

    /// Ask for a signed upload target for an attachment.
    ///
    /// The caller uploads the bytes to `upload_url` itself and then sends a
    /// message referencing `image_path`.
    async fn request_upload_target(&self, filename: &str, content_type: &str) -> Result<UploadTarget>;
}

#[cfg(feature = "rest-api")]
pub use http::HttpChatApi;

#[cfg(feature = "rest-api")]
mod http {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use reqwest::{RequestBuilder, Response, StatusCode};
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Serialize};
    use tracing::{debug, warn};

    use super::{ApiConfig, ChatApi};
    use crate::error::{LobbyLinkError, Result};
    use crate::protocol::chat::{ConversationSummary, HistoryPage, UploadTarget};

    /// [`ChatApi`] over HTTP with `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpChatApi {
        client: reqwest::Client,
        config: ApiConfig,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: BTreeMap<String, String>,
        #[serde(default)]
        message: Option<String>,
    }

    #[derive(Debug, Serialize)]
    struct UploadRequest<'a> {
        filename: &'a str,
        content_type: &'a str,
    }

    impl HttpChatApi {
        pub fn new(config: ApiConfig) -> Self {
            Self::with_client(reqwest::Client::new(), config)
        }

        /// Reuse an existing client (connection pool, proxies, timeouts).
        pub fn with_client(client: reqwest::Client, config: ApiConfig) -> Self {
            Self { client, config }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.config.base_url)
        }

        fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
            match &self.config.bearer_token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        }

        async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
            let response = self.authorize(request).send().await?;
            decode(response).await
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let text = response.text().await.unwrap_or_default();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY) {
            if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
                if !body.errors.is_empty() {
                    debug!(%status, fields = body.errors.len(), "validation error");
                    return Err(LobbyLinkError::Validation {
                        fields: body.errors,
                    });
                }
                if let Some(message) = body.message {
                    return Err(LobbyLinkError::Http(format!("{status}: {message}")));
                }
            }
        }
        warn!(%status, "request failed");
        Err(LobbyLinkError::Http(format!("{status}: {text}")))
    }

    #[async_trait]
    impl ChatApi for HttpChatApi {
        async fn fetch_history(
            &self,
            friend_id: &str,
            before: Option<&str>,
            limit: u32,
        ) -> Result<HistoryPage> {
            let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
            if let Some(before) = before {
                query.push(("before", before.to_owned()));
            }
            let request = self
                .client
                .get(self.url(&format!("/chat/conversations/{friend_id}/messages")))
                .query(&query);
            self.send(request).await
        }

        async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
            self.send(self.client.get(self.url("/chat/conversations"))).await
        }

        async fn request_upload_target(
            &self,
            filename: &str,
            content_type: &str,
        ) -> Result<UploadTarget> {
            let request = self
                .client
                .post(self.url("/chat/attachments/upload-url"))
                .json(&UploadRequest {
                    filename,
                    content_type,
                });
            self.send(request).await
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used, clippy::panic)]
    mod tests {
        use super::*;

        #[test]
        fn validation_body_parses_field_map() {
            let body: ErrorBody =
                serde_json::from_str(r#"{"errors":{"filename":"must not be empty"}}"#).unwrap();
            assert_eq!(
                body.errors.get("filename").map(String::as_str),
                Some("must not be empty")
            );
        }

        #[test]
        fn url_joins_without_double_slash() {
            let api = HttpChatApi::new(ApiConfig::new("http://localhost:8080/api/"));
            assert_eq!(
                api.url("/chat/conversations"),
                "http://localhost:8080/api/chat/conversations"
            );
        }
    }
}

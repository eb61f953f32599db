//! HTTP contract with the chat server.
//!
//! [`ChatApi`] is the seam between the synchronization core and the network:
//! the coordinator and poll loops only ever see this trait, and tests swap in
//! an in-memory implementation. [`HttpApi`] is the `reqwest` implementation.

use std::collections::HashMap;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::model::{Message, MessageKind, PrivateChat, User};

/// Body of `POST /send_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub content: String,
    pub username: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub user_id: i64,
    /// Echoed back by servers that support correlation; ignored otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Every HTTP route the core relies on.
///
/// Futures must be `Send` because the poll loops run on spawned tasks.
pub trait ChatApi: Send + Sync + 'static {
    /// `GET /generate-username`
    fn generate_username(&self) -> impl Future<Output = Result<String, ApiError>> + Send;

    /// `POST /join`
    fn join(&self, username: &str) -> impl Future<Output = Result<User, ApiError>> + Send;

    /// `GET /messages/new?user_id=`: only messages new since the last poll.
    fn new_messages(&self, user_id: i64) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// `GET /active-users?current_user_id=`
    fn active_users(&self, current_user_id: i64) -> impl Future<Output = Result<Vec<User>, ApiError>> + Send;

    /// `POST /send_message`
    fn send_message(&self, request: &SendRequest) -> impl Future<Output = Result<Message, ApiError>> + Send;

    /// `GET /chats/get-or-create?creator_id=&other_user_id=`
    fn get_or_create_chat(
        &self,
        creator_id: i64,
        other_user_id: i64,
    ) -> impl Future<Output = Result<PrivateChat, ApiError>> + Send;

    /// `GET /chats/{id}/messages`
    fn chat_messages(&self, chat_id: i64) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// `GET /notifications/unread-flags?current_user_id=`, keyed by peer id.
    fn unread_flags(
        &self,
        current_user_id: i64,
    ) -> impl Future<Output = Result<HashMap<i64, bool>, ApiError>> + Send;

    /// `POST /notifications/mark-read?user_id=&chat_id=`
    fn mark_read(&self, user_id: i64, chat_id: i64) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Deserialize)]
struct GeneratedUsername {
    username: String,
}

#[derive(Serialize)]
struct JoinRequest<'a> {
    username: &'a str,
}

/// `reqwest`-backed [`ChatApi`].
#[derive(Debug, Clone)]
pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(config: &ClientConfig) -> Self {
        // unwrap_or_default() falls back to a default client instead of panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(url: String, resp: reqwest::Response) -> Result<T, ApiError> {
        if !resp.status().is_success() {
            return Err(ApiError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| ApiError::Json {
            url: url.clone(),
            detail: e.to_string(),
        })?;

        serde_json::from_slice::<T>(&bytes).map_err(|e| ApiError::Json {
            url,
            detail: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, i64)]) -> Result<T, ApiError> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ApiError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        Self::decode(url, resp).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        Self::decode(url, resp).await
    }
}

impl ChatApi for HttpApi {
    async fn generate_username(&self) -> Result<String, ApiError> {
        let body: GeneratedUsername = self.get_json("/generate-username", &[]).await?;
        Ok(body.username)
    }

    async fn join(&self, username: &str) -> Result<User, ApiError> {
        self.post_json("/join", &JoinRequest { username }).await
    }

    async fn new_messages(&self, user_id: i64) -> Result<Vec<Message>, ApiError> {
        self.get_json("/messages/new", &[("user_id", user_id)]).await
    }

    async fn active_users(&self, current_user_id: i64) -> Result<Vec<User>, ApiError> {
        self.get_json("/active-users", &[("current_user_id", current_user_id)])
            .await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<Message, ApiError> {
        self.post_json("/send_message", request).await
    }

    async fn get_or_create_chat(&self, creator_id: i64, other_user_id: i64) -> Result<PrivateChat, ApiError> {
        self.get_json(
            "/chats/get-or-create",
            &[("creator_id", creator_id), ("other_user_id", other_user_id)],
        )
        .await
    }

    async fn chat_messages(&self, chat_id: i64) -> Result<Vec<Message>, ApiError> {
        self.get_json(&format!("/chats/{chat_id}/messages"), &[]).await
    }

    async fn unread_flags(&self, current_user_id: i64) -> Result<HashMap<i64, bool>, ApiError> {
        self.get_json(
            "/notifications/unread-flags",
            &[("current_user_id", current_user_id)],
        )
        .await
    }

    async fn mark_read(&self, user_id: i64, chat_id: i64) -> Result<(), ApiError> {
        let url = self.url("/notifications/mark-read");
        let resp = self
            .client
            .post(&url)
            .query(&[("user_id", user_id), ("chat_id", chat_id)])
            .send()
            .await
            .map_err(|e| ApiError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ApiError::Http {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(())
    }
}

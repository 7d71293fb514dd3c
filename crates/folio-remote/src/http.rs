//! HTTP adapters for the remote service contracts.
//!
//! Speak the backend's JSON routes: `/api/chats`, `/api/qa`, and
//! `/api/documents`. Non-2xx responses are mapped to [`RemoteError`]:
//! 404 becomes `NotFound`, other statuses become `Server` carrying the
//! body's `detail` field when present, and transport failures become
//! `Network`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use folio_core::types::{Answer, ChatSession, Document, Message, MessageId, Role, Source};

use crate::contract::{AnswerEngine, ChatWithMessages, DocumentService, SessionStore, StatusReport};
use crate::error::RemoteError;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct ChatCreateBody<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ChatUpdateBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct MessageCreateBody<'a> {
    role: Role,
    content: &'a str,
    sources: &'a [Source],
}

#[derive(Serialize)]
struct MessageUpdateBody<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<&'a [Source]>,
}

#[derive(Serialize)]
struct QuestionBody<'a> {
    question: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<&'a str>,
    is_regeneration: bool,
}

/// Message as it appears on the wire. The store never returns pending ids,
/// and collection routes omit the owning chat id (it is a path parameter).
#[derive(Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    chat_id: Option<String>,
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    sources: Option<Vec<Source>>,
}

impl WireMessage {
    fn into_message(self, chat_id: &str) -> Message {
        Message {
            id: MessageId::Persisted(self.id),
            chat_id: self.chat_id.unwrap_or_else(|| chat_id.to_string()),
            role: self.role,
            content: self.content,
            timestamp: self.timestamp,
            updated_at: self.updated_at,
            sources: self.sources.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct WireChatWithMessages {
    chat: ChatSession,
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

// =============================================================================
// Response handling
// =============================================================================

/// Map a non-2xx response to a [`RemoteError`], extracting the body's
/// `detail` field when the backend provides one.
async fn check(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = match resp.text().await {
        Ok(body) => serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.detail)
            .unwrap_or(body),
        Err(_) => String::new(),
    };

    if status == StatusCode::NOT_FOUND {
        Err(RemoteError::NotFound(message))
    } else {
        Err(RemoteError::Server {
            status: status.as_u16(),
            message,
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
}

// =============================================================================
// HttpSessionStore
// =============================================================================

/// Session store client speaking the `/api/chats` routes.
pub struct HttpSessionStore {
    client: Client,
    base_url: String,
}

impl HttpSessionStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chats{}", self.base_url, path)
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    async fn create_chat(
        &self,
        title: &str,
        document_id: Option<&str>,
    ) -> Result<ChatSession, RemoteError> {
        debug!(title, "Creating chat");
        let resp = self
            .client
            .post(self.url("/"))
            .json(&ChatCreateBody { title, document_id })
            .send()
            .await?;
        decode(check(resp).await?).await
    }

    async fn get_chats(&self, document_id: Option<&str>) -> Result<Vec<ChatSession>, RemoteError> {
        let mut req = self.client.get(self.url("/"));
        if let Some(doc) = document_id {
            req = req.query(&[("document_id", doc)]);
        }
        let resp = req.send().await?;
        decode(check(resp).await?).await
    }

    async fn get_chat(&self, chat_id: &str) -> Result<ChatWithMessages, RemoteError> {
        let resp = self
            .client
            .get(self.url(&format!("/{}", chat_id)))
            .send()
            .await?;
        let wire: WireChatWithMessages = decode(check(resp).await?).await?;
        Ok(ChatWithMessages {
            messages: wire
                .messages
                .into_iter()
                .map(|m| m.into_message(chat_id))
                .collect(),
            chat: wire.chat,
        })
    }

    async fn update_chat(&self, chat_id: &str, title: &str) -> Result<ChatSession, RemoteError> {
        let resp = self
            .client
            .put(self.url(&format!("/{}", chat_id)))
            .json(&ChatUpdateBody { title })
            .send()
            .await?;
        decode(check(resp).await?).await
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), RemoteError> {
        let resp = self
            .client
            .delete(self.url(&format!("/{}", chat_id)))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn add_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        sources: &[Source],
    ) -> Result<Message, RemoteError> {
        let resp = self
            .client
            .post(self.url(&format!("/{}/messages", chat_id)))
            .json(&MessageCreateBody {
                role,
                content,
                sources,
            })
            .send()
            .await?;
        let wire: WireMessage = decode(check(resp).await?).await?;
        Ok(wire.into_message(chat_id))
    }

    async fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        content: &str,
        sources: Option<&[Source]>,
    ) -> Result<Message, RemoteError> {
        let resp = self
            .client
            .put(self.url(&format!("/{}/messages/{}", chat_id, message_id)))
            .json(&MessageUpdateBody { content, sources })
            .send()
            .await?;
        let wire: WireMessage = decode(check(resp).await?).await?;
        Ok(wire.into_message(chat_id))
    }

    async fn clear_messages(&self, chat_id: &str) -> Result<(), RemoteError> {
        let resp = self
            .client
            .delete(self.url(&format!("/{}/messages", chat_id)))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

// =============================================================================
// HttpAnswerEngine
// =============================================================================

/// QA engine client speaking the `/api/qa` routes.
pub struct HttpAnswerEngine {
    client: Client,
    base_url: String,
}

impl HttpAnswerEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/qa{}", self.base_url, path)
    }
}

#[async_trait]
impl AnswerEngine for HttpAnswerEngine {
    async fn ask(
        &self,
        question: &str,
        chat_id: Option<&str>,
        regeneration: bool,
    ) -> Result<Answer, RemoteError> {
        debug!(question, "Asking question");
        let resp = self
            .client
            .post(self.url("/ask"))
            .json(&QuestionBody {
                question,
                chat_id,
                is_regeneration: regeneration,
            })
            .send()
            .await?;
        decode(check(resp).await?).await
    }

    async fn ask_document(
        &self,
        document_id: &str,
        question: &str,
        chat_id: Option<&str>,
        regeneration: bool,
    ) -> Result<Answer, RemoteError> {
        debug!(document_id, question, "Asking document question");
        let mut query: Vec<(&str, String)> = vec![
            ("question", question.to_string()),
            ("is_regeneration", regeneration.to_string()),
        ];
        if let Some(chat) = chat_id {
            query.push(("chat_id", chat.to_string()));
        }
        let resp = self
            .client
            .get(self.url(&format!("/documents/{}/ask", document_id)))
            .query(&query)
            .send()
            .await?;
        decode(check(resp).await?).await
    }

    async fn clear_memory(&self) -> Result<(), RemoteError> {
        let resp = self.client.post(self.url("/clear-memory")).send().await?;
        check(resp).await?;
        Ok(())
    }
}

// =============================================================================
// HttpDocumentService
// =============================================================================

/// Document service client speaking the `/api/documents` routes.
pub struct HttpDocumentService {
    client: Client,
    base_url: String,
}

impl HttpDocumentService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/documents{}", self.base_url, path)
    }
}

#[async_trait]
impl DocumentService for HttpDocumentService {
    async fn get_document(&self, document_id: &str) -> Result<Document, RemoteError> {
        let resp = self
            .client
            .get(self.url(&format!("/{}", document_id)))
            .send()
            .await?;
        decode(check(resp).await?).await
    }

    async fn get_status(&self, document_id: &str) -> Result<StatusReport, RemoteError> {
        let resp = self
            .client
            .get(self.url(&format!("/{}/status", document_id)))
            .send()
            .await?;
        decode(check(resp).await?).await
    }
}

// =============================================================================
// Tests
// =============================================================================

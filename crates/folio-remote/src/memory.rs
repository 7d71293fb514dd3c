//! In-memory adapters for the remote service contracts.
//!
//! Implement the backend's bookkeeping semantics (message counts,
//! previews, updated-at stamping) without any transport. Used for
//! wiring the core in tests and local tooling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use folio_core::types::{
    preview_of, Answer, ChatSession, Document, Message, MessageId, Role, Source, EMPTY_PREVIEW,
};

use crate::contract::{AnswerEngine, ChatWithMessages, DocumentService, SessionStore, StatusReport};
use crate::error::RemoteError;

fn lock_err<E: std::fmt::Display>(e: E) -> RemoteError {
    RemoteError::Server {
        status: 500,
        message: format!("store lock poisoned: {}", e),
    }
}

// =============================================================================
// MemorySessionStore
// =============================================================================

#[derive(Default)]
struct StoreInner {
    chats: HashMap<String, ChatSession>,
    messages: HashMap<String, Vec<Message>>,
}

/// In-memory session store with the persistent store's bookkeeping rules.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<StoreInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chats currently stored.
    pub fn chat_count(&self) -> usize {
        self.inner.lock().map(|s| s.chats.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_chat(
        &self,
        title: &str,
        document_id: Option<&str>,
    ) -> Result<ChatSession, RemoteError> {
        let now = Utc::now();
        let chat = ChatSession {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            document_id: document_id.map(|d| d.to_string()),
            created_at: now,
            updated_at: now,
            message_count: 0,
            preview: EMPTY_PREVIEW.to_string(),
        };
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.chats.insert(chat.id.clone(), chat.clone());
        inner.messages.insert(chat.id.clone(), Vec::new());
        Ok(chat)
    }

    async fn get_chats(&self, document_id: Option<&str>) -> Result<Vec<ChatSession>, RemoteError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        let mut chats: Vec<ChatSession> = inner
            .chats
            .values()
            .filter(|c| match document_id {
                Some(doc) => c.document_id.as_deref() == Some(doc),
                None => true,
            })
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<ChatWithMessages, RemoteError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        let chat = inner
            .chats
            .get(chat_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound("Chat not found".to_string()))?;
        let messages = inner.messages.get(chat_id).cloned().unwrap_or_default();
        Ok(ChatWithMessages { chat, messages })
    }

    async fn update_chat(&self, chat_id: &str, title: &str) -> Result<ChatSession, RemoteError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let chat = inner
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| RemoteError::NotFound("Chat not found".to_string()))?;
        chat.title = title.to_string();
        chat.updated_at = Utc::now();
        Ok(chat.clone())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        if inner.chats.remove(chat_id).is_none() {
            return Err(RemoteError::NotFound("Chat not found".to_string()));
        }
        inner.messages.remove(chat_id);
        Ok(())
    }

    async fn add_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        sources: &[Source],
    ) -> Result<Message, RemoteError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        // Store-side bookkeeping: count, preview (assistant turns only).
        let chat = inner
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| RemoteError::NotFound("Chat not found".to_string()))?;
        chat.message_count += 1;
        chat.updated_at = Utc::now();
        if role == Role::Assistant {
            chat.preview = preview_of(content);
        }

        let message = Message {
            id: MessageId::Persisted(Uuid::new_v4().to_string()),
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            updated_at: None,
            sources: sources.to_vec(),
        };
        inner
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn update_message(
        &self,
        chat_id: &str,
        message_id: &str,
        content: &str,
        sources: Option<&[Source]>,
    ) -> Result<Message, RemoteError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let messages = inner
            .messages
            .get_mut(chat_id)
            .ok_or_else(|| RemoteError::NotFound("Chat not found".to_string()))?;
        let message = messages
            .iter_mut()
            .find(|m| m.id.persisted() == Some(message_id))
            .ok_or_else(|| RemoteError::NotFound("Message not found".to_string()))?;
        message.content = content.to_string();
        if let Some(sources) = sources {
            message.sources = sources.to_vec();
        }
        message.updated_at = Some(Utc::now());
        let updated = message.clone();

        let chat = inner
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| RemoteError::NotFound("Chat not found".to_string()))?;
        chat.updated_at = Utc::now();
        Ok(updated)
    }

    async fn clear_messages(&self, chat_id: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let chat = inner
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| RemoteError::NotFound("Chat not found".to_string()))?;
        chat.message_count = 0;
        chat.preview = EMPTY_PREVIEW.to_string();
        chat.updated_at = Utc::now();
        inner.messages.insert(chat_id.to_string(), Vec::new());
        Ok(())
    }
}

// =============================================================================
// CannedAnswerEngine
// =============================================================================

/// Answer engine that replays scripted answers, falling back to an echo.
///
/// Records every question and context reset so callers can assert on
/// engine traffic.
#[derive(Default)]
pub struct CannedAnswerEngine {
    answers: Mutex<VecDeque<Answer>>,
    questions: Mutex<Vec<String>>,
    reset_calls: AtomicUsize,
}

impl CannedAnswerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer to be returned by the next ask call.
    pub fn push_answer(&self, answer: Answer) {
        if let Ok(mut answers) = self.answers.lock() {
            answers.push_back(answer);
        }
    }

    /// Every question asked so far, in order.
    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().map(|q| q.clone()).unwrap_or_default()
    }

    pub fn ask_count(&self) -> usize {
        self.questions.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn reset_count(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    fn answer_for(&self, question: &str) -> Answer {
        if let Ok(mut questions) = self.questions.lock() {
            questions.push(question.to_string());
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front())
            .unwrap_or_else(|| Answer {
                answer: format!("Answer to: {}", question),
                sources: vec![],
            })
    }
}

#[async_trait]
impl AnswerEngine for CannedAnswerEngine {
    async fn ask(
        &self,
        question: &str,
        _chat_id: Option<&str>,
        _regeneration: bool,
    ) -> Result<Answer, RemoteError> {
        Ok(self.answer_for(question))
    }

    async fn ask_document(
        &self,
        _document_id: &str,
        question: &str,
        _chat_id: Option<&str>,
        _regeneration: bool,
    ) -> Result<Answer, RemoteError> {
        Ok(self.answer_for(question))
    }

    async fn clear_memory(&self) -> Result<(), RemoteError> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MemoryDocumentService
// =============================================================================

/// Document service over an in-memory table, with scriptable status
/// sequences for exercising the ingestion poller.
#[derive(Default)]
pub struct MemoryDocumentService {
    docs: Mutex<HashMap<String, Document>>,
    status_script: Mutex<HashMap<String, VecDeque<StatusReport>>>,
    status_calls: AtomicUsize,
    document_fetches: AtomicUsize,
}

impl MemoryDocumentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        if let Ok(mut docs) = self.docs.lock() {
            docs.insert(document.id.clone(), document);
        }
    }

    /// Queue a status report for a document; reports are consumed in order,
    /// after which the document record's own status is reported.
    pub fn push_status(&self, document_id: &str, report: StatusReport) {
        if let Ok(mut script) = self.status_script.lock() {
            script
                .entry(document_id.to_string())
                .or_default()
                .push_back(report);
        }
    }

    /// Number of status checks served.
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Number of full document fetches served.
    pub fn document_fetches(&self) -> usize {
        self.document_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentService for MemoryDocumentService {
    async fn get_document(&self, document_id: &str) -> Result<Document, RemoteError> {
        self.document_fetches.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .map_err(lock_err)?
            .get(document_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound("Document not found".to_string()))
    }

    async fn get_status(&self, document_id: &str) -> Result<StatusReport, RemoteError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(report) = self
            .status_script
            .lock()
            .map_err(lock_err)?
            .get_mut(document_id)
            .and_then(|q| q.pop_front())
        {
            return Ok(report);
        }
        let docs = self.docs.lock().map_err(lock_err)?;
        let doc = docs
            .get(document_id)
            .ok_or_else(|| RemoteError::NotFound("Document not found".to_string()))?;
        Ok(StatusReport {
            status: doc.status,
            error_message: None,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

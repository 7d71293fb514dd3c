//! Conversation controller: owns the active chat id and ordered transcript.
//!
//! Allocates chat sessions lazily and exactly once, reconciles optimistic
//! and persisted state under partial failure, supports in-place edit and
//! regeneration of past turns, and keeps answer-engine context isolated
//! per chat.
//!
//! Every remote-backed operation has a documented local fallback that keeps
//! the visible transcript consistent even when persistence fails. Failures
//! are captured into `last_error`; precondition violations abort before any
//! remote call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use folio_core::config::ConversationConfig;
use folio_core::events::ConversationEvent;
use folio_core::types::{derive_title, ChatSession, Message, MessageId, Role, Source, Timestamp};
use folio_remote::{AnswerEngine, RemoteError, SessionStore};

use crate::cache::HistoryCache;
use crate::error::ChatError;
use crate::isolation::ContextIsolation;
use crate::state::ConversationState;

/// Broadcast channel capacity for conversation events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Central coordinator for one conversation surface.
///
/// The `messages` transcript and `active_chat_id` are exclusively owned by
/// one controller instance. Mutating operations serialize through an async
/// op guard, so overlapping calls from undisciplined callers cannot race
/// the active-chat assignment. A monotonic generation counter, bumped on
/// every active-chat change, lets in-flight answer requests detect that
/// the conversation moved on and discard their result.
pub struct ConversationController {
    store: Arc<dyn SessionStore>,
    engine: Arc<dyn AnswerEngine>,
    isolation: ContextIsolation,
    config: ConversationConfig,
    /// When set, chats are created scoped to this document and questions
    /// are routed through the document-scoped ask endpoint.
    document_id: Option<String>,
    cache: Option<Arc<dyn HistoryCache>>,
    state: Mutex<ConversationState>,
    generation: AtomicU64,
    op_guard: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl ConversationController {
    pub fn new(store: Arc<dyn SessionStore>, engine: Arc<dyn AnswerEngine>) -> Self {
        Self::with_config(store, engine, ConversationConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn AnswerEngine>,
        config: ConversationConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            isolation: ContextIsolation::new(engine.clone()),
            engine,
            config,
            document_id: None,
            cache: None,
            state: Mutex::new(ConversationState::default()),
            generation: AtomicU64::new(0),
            op_guard: tokio::sync::Mutex::new(()),
            event_tx,
        }
    }

    /// Scope this controller to a document; new chats carry its id and
    /// questions go through the document-scoped ask endpoint.
    pub fn bind_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Attach a durable local transcript cache, snapshotted best-effort
    /// after each mutation.
    pub fn with_history_cache(mut self, cache: Arc<dyn HistoryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cloned snapshot of the current state.
    pub fn state(&self) -> ConversationState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Subscribe to conversation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_tx.subscribe()
    }

    /// Current chat-switch generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Fetch a chat and its messages, replacing local state wholesale.
    ///
    /// On failure the transcript is emptied and `last_error` set.
    pub async fn load_messages(&self, chat_id: &str) -> Result<(), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.load_messages_inner(chat_id).await
    }

    /// Append a user turn, creating a chat first if none is active.
    ///
    /// Returns the message and the chat id actually used. Callers must pass
    /// that id to the paired answer call rather than re-reading the
    /// controller's active id, otherwise two near-simultaneous first
    /// messages can each try to create a chat.
    ///
    /// On remote failure a pending message is appended locally so the
    /// transcript is never silently dropped, `last_error` is set, and the
    /// call still returns `Ok`.
    pub async fn add_user_message(
        &self,
        content: &str,
    ) -> Result<(Message, Option<String>), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.add_user_message_inner(content).await
    }

    /// Append an assistant turn, symmetric to [`add_user_message`].
    ///
    /// Uses `chat_id_hint` when given (from the paired user write), else the
    /// active chat id; creates a chat with the default title if none exists.
    ///
    /// [`add_user_message`]: Self::add_user_message
    pub async fn add_assistant_message(
        &self,
        content: &str,
        sources: Vec<Source>,
        chat_id_hint: Option<&str>,
    ) -> Result<(Message, Option<String>), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.add_assistant_message_inner(content, sources, chat_id_hint)
            .await
    }

    /// Edit a user message in place, preserving its id and position.
    ///
    /// Requires an active chat. On remote failure the same content change
    /// is applied to the local copy without persisting.
    pub async fn update_user_message(
        &self,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.update_user_message_inner(message_id, new_content).await
    }

    /// Replace the content and sources of the most recent assistant turn,
    /// stamping `updated_at`.
    ///
    /// Scans backward from the end of the transcript; fails with
    /// [`ChatError::NoAssistantMessage`] if no assistant turn exists. On
    /// remote failure the same message is mutated locally without
    /// persisting.
    pub async fn regenerate_answer(
        &self,
        new_content: &str,
        new_sources: Vec<Source>,
    ) -> Result<(), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.regenerate_answer_inner(new_content, new_sources).await
    }

    /// Write a user turn followed by an assistant turn.
    ///
    /// The two writes are sequential, not atomic: a failure between them
    /// can leave a chat holding only the user turn. That partial state is
    /// accepted, not hidden.
    pub async fn add_complete_exchange(
        &self,
        question: &str,
        answer: &str,
        sources: Vec<Source>,
    ) -> Result<Option<String>, ChatError> {
        let _guard = self.op_guard.lock().await;
        let (_, chat_id) = self.add_user_message_inner(question).await?;
        let (_, used) = self
            .add_assistant_message_inner(answer, sources, chat_id.as_deref())
            .await?;
        Ok(used.or(chat_id))
    }

    /// Reset the engine context and, if a chat is active, clear its
    /// messages remotely and locally.
    ///
    /// Exactly one context reset and at most one remote clear are issued;
    /// the reset is independent of the clear's outcome. The local
    /// transcript is emptied even when the remote clear fails.
    pub async fn clear_conversation(&self) -> Result<(), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.begin_op();

        self.isolation.reset_context().await;
        self.emit(ConversationEvent::ContextResetIssued {
            timestamp: Timestamp::now(),
        });

        let Some(chat_id) = self.active_chat() else {
            self.with_state(|s| {
                s.messages.clear();
                s.is_loading = false;
            });
            return Ok(());
        };

        let result = self.store.clear_messages(&chat_id).await;
        self.with_state(|s| {
            s.messages.clear();
            s.is_loading = false;
            if let Err(e) = &result {
                s.last_error = Some(e.to_string());
            }
        });
        self.remove_cached(&chat_id);
        self.emit(ConversationEvent::ConversationCleared {
            chat_id,
            timestamp: Timestamp::now(),
        });

        result.map_err(|e| ChatError::RemoteWrite(e.to_string()))
    }

    /// Make `chat_id` the active chat and load its messages.
    ///
    /// Switching to the already-active id is a no-op with no reset call.
    /// Otherwise the context reset is issued before the active id changes;
    /// a reset failure is logged only and never blocks the switch.
    pub async fn load_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let _guard = self.op_guard.lock().await;

        let current = self.active_chat();
        if current.as_deref() == Some(chat_id) {
            debug!(chat_id, "Chat already active, skipping reset and reload");
            return Ok(());
        }

        self.isolation.reset_context().await;
        self.emit(ConversationEvent::ContextResetIssued {
            timestamp: Timestamp::now(),
        });

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| s.active_chat_id = Some(chat_id.to_string()));
        self.emit(ConversationEvent::ChatSwitched {
            from: current,
            to: chat_id.to_string(),
            timestamp: Timestamp::now(),
        });

        self.load_messages_inner(chat_id).await
    }

    /// Delete a chat remotely; if it was active, reset local state to
    /// no-active-chat and issue a context reset.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let _guard = self.op_guard.lock().await;
        self.begin_op();

        if let Err(e) = self.store.delete_chat(chat_id).await {
            self.with_state(|s| {
                s.last_error = Some(e.to_string());
                s.is_loading = false;
            });
            return Err(ChatError::RemoteWrite(e.to_string()));
        }

        self.remove_cached(chat_id);

        let was_active = self.active_chat().as_deref() == Some(chat_id);
        if was_active {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.with_state(|s| {
                s.active_chat_id = None;
                s.messages.clear();
                s.is_loading = false;
            });
            self.isolation.reset_context().await;
            self.emit(ConversationEvent::ContextResetIssued {
                timestamp: Timestamp::now(),
            });
        } else {
            self.with_state(|s| s.is_loading = false);
        }

        self.emit(ConversationEvent::ChatDeleted {
            chat_id: chat_id.to_string(),
            timestamp: Timestamp::now(),
        });
        Ok(())
    }

    /// Rename a chat in the session store.
    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<ChatSession, ChatError> {
        let _guard = self.op_guard.lock().await;
        self.begin_op();
        let result = self.store.update_chat(chat_id, title).await;
        self.with_state(|s| {
            s.is_loading = false;
            if let Err(e) = &result {
                s.last_error = Some(e.to_string());
            }
        });
        result.map_err(|e| ChatError::RemoteWrite(e.to_string()))
    }

    /// Content of the most recent user turn, or empty if none.
    ///
    /// Supports retry without re-deriving state elsewhere.
    pub fn last_question(&self) -> String {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.last_of_role(Role::User).map(|m| m.content.clone()))
            .unwrap_or_default()
    }

    // =========================================================================
    // Turn drivers
    // =========================================================================

    /// Run one full turn: write the user message, ask the engine, write the
    /// answer.
    ///
    /// The answer call uses the chat id returned by the user write, not the
    /// controller's cached id. If the active chat changes while the engine
    /// call is in flight, the late answer is discarded and `Ok(None)` is
    /// returned.
    pub async fn submit_question(&self, question: &str) -> Result<Option<Message>, ChatError> {
        let generation = self.generation();
        let (_, chat_id) = self.add_user_message(question).await?;
        self.finish_turn(question, chat_id, generation, false).await
    }

    /// Re-submit the most recent user question, if any.
    pub async fn retry_last_question(&self) -> Result<Option<Message>, ChatError> {
        let question = self.last_question();
        if question.is_empty() {
            return Ok(None);
        }
        self.submit_question(&question).await
    }

    /// Edit a user message, ask for a fresh answer, and update the most
    /// recent assistant turn in place (same id) rather than appending.
    ///
    /// A remote-write failure on either the edit or the regeneration has
    /// already applied its local fallback and does not abort the flow.
    pub async fn edit_and_resubmit(
        &self,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<Option<Message>, ChatError> {
        let generation = self.generation();

        match self.update_user_message(message_id, new_content).await {
            Ok(()) | Err(ChatError::RemoteWrite(_)) => {}
            Err(e) => return Err(e),
        }

        let chat_id = self.active_chat();
        let answer = self
            .ask_engine(new_content, chat_id.as_deref(), true)
            .await?;

        let Some(answer) = self.unless_stale(generation, answer) else {
            return Ok(None);
        };

        match self
            .regenerate_answer(&answer.answer, answer.sources)
            .await
        {
            Ok(()) | Err(ChatError::RemoteWrite(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(self
            .state
            .lock()
            .ok()
            .and_then(|s| s.last_of_role(Role::Assistant).cloned()))
    }

    // =========================================================================
    // Inner operations (callers hold the op guard)
    // =========================================================================

    async fn load_messages_inner(&self, chat_id: &str) -> Result<(), ChatError> {
        self.begin_op();
        match self.store.get_chat(chat_id).await {
            Ok(result) => {
                let message_count = result.messages.len();
                self.with_state(|s| {
                    s.active_chat_id = Some(chat_id.to_string());
                    s.messages = result.messages;
                    s.is_loading = false;
                });
                self.snapshot_to_cache();
                self.emit(ConversationEvent::ConversationLoaded {
                    chat_id: chat_id.to_string(),
                    message_count,
                    timestamp: Timestamp::now(),
                });
                Ok(())
            }
            Err(e) => {
                self.with_state(|s| {
                    s.messages.clear();
                    s.last_error = Some(e.to_string());
                    s.is_loading = false;
                });
                Err(ChatError::RemoteFetch(e.to_string()))
            }
        }
    }

    async fn add_user_message_inner(
        &self,
        content: &str,
    ) -> Result<(Message, Option<String>), ChatError> {
        self.begin_op();

        let chat_id = match self.active_chat() {
            Some(id) => id,
            None => {
                let title = derive_title(content, self.config.title_max_chars);
                match self.ensure_chat(&title).await {
                    Some(id) => id,
                    None => {
                        // Chat creation failed; keep the turn visible anyway.
                        let message = self.append_pending(None, Role::User, content, vec![]);
                        return Ok((message, None));
                    }
                }
            }
        };

        match self
            .store
            .add_message(&chat_id, Role::User, content, &[])
            .await
        {
            Ok(message) => {
                self.append_persisted(&message);
                Ok((message, Some(chat_id)))
            }
            Err(e) => {
                warn!("User message write failed: {}", e);
                self.with_state(|s| s.last_error = Some(e.to_string()));
                let message = self.append_pending(Some(&chat_id), Role::User, content, vec![]);
                Ok((message, Some(chat_id)))
            }
        }
    }

    async fn add_assistant_message_inner(
        &self,
        content: &str,
        sources: Vec<Source>,
        chat_id_hint: Option<&str>,
    ) -> Result<(Message, Option<String>), ChatError> {
        self.begin_op();

        let chat_id = match chat_id_hint.map(|s| s.to_string()).or_else(|| self.active_chat()) {
            Some(id) => id,
            None => {
                let title = self.config.default_title.clone();
                match self.ensure_chat(&title).await {
                    Some(id) => id,
                    None => {
                        let message = self.append_pending(None, Role::Assistant, content, sources);
                        return Ok((message, None));
                    }
                }
            }
        };

        match self
            .store
            .add_message(&chat_id, Role::Assistant, content, &sources)
            .await
        {
            Ok(message) => {
                self.append_persisted(&message);
                Ok((message, Some(chat_id)))
            }
            Err(e) => {
                warn!("Assistant message write failed: {}", e);
                self.with_state(|s| s.last_error = Some(e.to_string()));
                let message =
                    self.append_pending(Some(&chat_id), Role::Assistant, content, sources);
                Ok((message, Some(chat_id)))
            }
        }
    }

    async fn update_user_message_inner(
        &self,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), ChatError> {
        self.begin_op();

        let Some(chat_id) = self.active_chat() else {
            self.with_state(|s| {
                s.last_error = Some(ChatError::NoActiveConversation.to_string());
                s.is_loading = false;
            });
            return Err(ChatError::NoActiveConversation);
        };

        let remote_result = match message_id.persisted() {
            Some(remote_id) => self
                .store
                .update_message(&chat_id, remote_id, new_content, None)
                .await
                .map(Some),
            // Pending ids never cross the wire; the edit stays local.
            None => Ok(None),
        };

        match remote_result {
            Ok(updated) => {
                let stamp = updated
                    .as_ref()
                    .and_then(|m| m.updated_at)
                    .unwrap_or_else(Utc::now);
                self.with_state(|s| {
                    if let Some(m) = s.messages.iter_mut().find(|m| &m.id == message_id) {
                        m.content = new_content.to_string();
                        m.updated_at = Some(stamp);
                    }
                    s.is_loading = false;
                });
                self.snapshot_to_cache();
                self.emit(ConversationEvent::MessageEdited {
                    chat_id,
                    message_id: message_id.clone(),
                    timestamp: Timestamp::now(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Message update failed, applying local edit only: {}", e);
                self.with_state(|s| {
                    if let Some(m) = s.messages.iter_mut().find(|m| &m.id == message_id) {
                        m.content = new_content.to_string();
                        m.updated_at = Some(Utc::now());
                    }
                    s.last_error = Some(e.to_string());
                    s.is_loading = false;
                });
                self.snapshot_to_cache();
                self.emit(ConversationEvent::MessageEdited {
                    chat_id,
                    message_id: message_id.clone(),
                    timestamp: Timestamp::now(),
                });
                Err(ChatError::RemoteWrite(e.to_string()))
            }
        }
    }

    async fn regenerate_answer_inner(
        &self,
        new_content: &str,
        new_sources: Vec<Source>,
    ) -> Result<(), ChatError> {
        self.begin_op();

        // Most recent assistant turn, scanning backward.
        let target = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.last_of_role(Role::Assistant).map(|m| m.id.clone()));

        let Some(target_id) = target else {
            self.with_state(|s| {
                s.last_error = Some(ChatError::NoAssistantMessage.to_string());
                s.is_loading = false;
            });
            return Err(ChatError::NoAssistantMessage);
        };

        let chat_id = self.active_chat();
        let remote_result = match (target_id.persisted(), chat_id.as_deref()) {
            (Some(remote_id), Some(chat)) => self
                .store
                .update_message(chat, remote_id, new_content, Some(&new_sources))
                .await
                .map(Some),
            // Pending target or no chat: the regeneration stays local.
            _ => Ok(None),
        };

        let apply = |s: &mut ConversationState, stamp| {
            if let Some(m) = s.messages.iter_mut().find(|m| m.id == target_id) {
                m.content = new_content.to_string();
                m.sources = new_sources.clone();
                m.updated_at = Some(stamp);
            }
            s.is_loading = false;
        };

        match remote_result {
            Ok(updated) => {
                let stamp = updated
                    .as_ref()
                    .and_then(|m| m.updated_at)
                    .unwrap_or_else(Utc::now);
                self.with_state(|s| apply(s, stamp));
                self.snapshot_to_cache();
                self.emit(ConversationEvent::AnswerRegenerated {
                    chat_id: chat_id.unwrap_or_default(),
                    message_id: target_id.clone(),
                    timestamp: Timestamp::now(),
                });
                Ok(())
            }
            Err(e) => {
                warn!("Regeneration write failed, applying locally: {}", e);
                self.with_state(|s| {
                    apply(s, Utc::now());
                    s.last_error = Some(e.to_string());
                });
                self.snapshot_to_cache();
                self.emit(ConversationEvent::AnswerRegenerated {
                    chat_id: chat_id.unwrap_or_default(),
                    message_id: target_id.clone(),
                    timestamp: Timestamp::now(),
                });
                Err(ChatError::RemoteWrite(e.to_string()))
            }
        }
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    /// Create a chat and make it active. Returns `None` on remote failure,
    /// recording `last_error`.
    async fn ensure_chat(&self, title: &str) -> Option<String> {
        match self
            .store
            .create_chat(title, self.document_id.as_deref())
            .await
        {
            Ok(chat) => {
                self.with_state(|s| s.active_chat_id = Some(chat.id.clone()));
                self.emit(ConversationEvent::ChatCreated {
                    chat_id: chat.id.clone(),
                    timestamp: Timestamp::now(),
                });
                Some(chat.id)
            }
            Err(e) => {
                warn!("Chat creation failed: {}", e);
                self.with_state(|s| s.last_error = Some(e.to_string()));
                None
            }
        }
    }

    async fn ask_engine(
        &self,
        question: &str,
        chat_id: Option<&str>,
        regeneration: bool,
    ) -> Result<folio_core::types::Answer, ChatError> {
        let result = match &self.document_id {
            Some(doc) => {
                self.engine
                    .ask_document(doc, question, chat_id, regeneration)
                    .await
            }
            None => self.engine.ask(question, chat_id, regeneration).await,
        };
        result.map_err(|e: RemoteError| {
            self.with_state(|s| s.last_error = Some(e.to_string()));
            ChatError::RemoteFetch(e.to_string())
        })
    }

    async fn finish_turn(
        &self,
        question: &str,
        chat_id: Option<String>,
        generation: u64,
        regeneration: bool,
    ) -> Result<Option<Message>, ChatError> {
        let answer = self
            .ask_engine(question, chat_id.as_deref(), regeneration)
            .await?;

        let Some(answer) = self.unless_stale(generation, answer) else {
            return Ok(None);
        };

        let (message, _) = self
            .add_assistant_message(&answer.answer, answer.sources, chat_id.as_deref())
            .await?;
        Ok(Some(message))
    }

    /// Drop an engine result whose originating generation has been
    /// superseded by a chat switch.
    fn unless_stale<T>(&self, generation: u64, value: T) -> Option<T> {
        if self.generation() != generation {
            debug!("Discarding answer from a superseded conversation");
            None
        } else {
            Some(value)
        }
    }

    fn active_chat(&self) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.active_chat_id.clone())
    }

    fn begin_op(&self) {
        self.with_state(|s| {
            s.is_loading = true;
            s.last_error = None;
        });
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ConversationState) -> T) -> Option<T> {
        match self.state.lock() {
            Ok(mut s) => Some(f(&mut s)),
            Err(e) => {
                error!("State lock poisoned: {}", e);
                None
            }
        }
    }

    fn append_persisted(&self, message: &Message) {
        self.with_state(|s| {
            s.messages.push(message.clone());
            s.is_loading = false;
        });
        self.snapshot_to_cache();
        self.emit(ConversationEvent::MessageAppended {
            chat_id: message.chat_id.clone(),
            message_id: message.id.clone(),
            role: message.role,
            pending: false,
            timestamp: Timestamp::now(),
        });
    }

    fn append_pending(
        &self,
        chat_id: Option<&str>,
        role: Role,
        content: &str,
        sources: Vec<Source>,
    ) -> Message {
        let message = Message::pending(chat_id.unwrap_or(""), role, content, sources);
        self.with_state(|s| {
            s.messages.push(message.clone());
            s.is_loading = false;
        });
        self.snapshot_to_cache();
        self.emit(ConversationEvent::MessageAppended {
            chat_id: message.chat_id.clone(),
            message_id: message.id.clone(),
            role,
            pending: true,
            timestamp: Timestamp::now(),
        });
        message
    }

    fn emit(&self, event: ConversationEvent) {
        debug!(event = event.event_name(), "Conversation event");
        let _ = self.event_tx.send(event);
    }

    fn snapshot_to_cache(&self) {
        let Some(cache) = &self.cache else { return };
        let Some((chat_id, transcript)) = self
            .state
            .lock()
            .ok()
            .and_then(|s| {
                s.active_chat_id
                    .clone()
                    .map(|id| (id, serde_json::to_string(&s.messages)))
            })
            .and_then(|(id, json)| json.ok().map(|j| (id, j)))
        else {
            return;
        };
        if let Err(e) = cache.set(&chat_id, &transcript) {
            warn!("History cache write failed (ignored): {}", e);
        }
    }

    fn remove_cached(&self, chat_id: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove(chat_id) {
                warn!("History cache removal failed (ignored): {}", e);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    use folio_core::types::DEFAULT_CHAT_TITLE;
    use folio_remote::{
        CannedAnswerEngine, ChatWithMessages, MemorySessionStore, RemoteError, SessionStore,
    };

    /// Session store wrapper with per-operation failure injection.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemorySessionStore,
        fail_create: AtomicBool,
        fail_add: AtomicBool,
        fail_update: AtomicBool,
        fail_get: AtomicBool,
        fail_clear: AtomicBool,
        fail_delete: AtomicBool,
        clear_calls: std::sync::atomic::AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self::default()
        }

        fn fail(flag: &AtomicBool) -> Result<(), RemoteError> {
            if flag.load(Ordering::SeqCst) {
                Err(RemoteError::Network("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn create_chat(
            &self,
            title: &str,
            document_id: Option<&str>,
        ) -> Result<folio_core::types::ChatSession, RemoteError> {
            Self::fail(&self.fail_create)?;
            self.inner.create_chat(title, document_id).await
        }

        async fn get_chats(
            &self,
            document_id: Option<&str>,
        ) -> Result<Vec<folio_core::types::ChatSession>, RemoteError> {
            self.inner.get_chats(document_id).await
        }

        async fn get_chat(&self, chat_id: &str) -> Result<ChatWithMessages, RemoteError> {
            Self::fail(&self.fail_get)?;
            self.inner.get_chat(chat_id).await
        }

        async fn update_chat(
            &self,
            chat_id: &str,
            title: &str,
        ) -> Result<folio_core::types::ChatSession, RemoteError> {
            Self::fail(&self.fail_update)?;
            self.inner.update_chat(chat_id, title).await
        }

        async fn delete_chat(&self, chat_id: &str) -> Result<(), RemoteError> {
            Self::fail(&self.fail_delete)?;
            self.inner.delete_chat(chat_id).await
        }

        async fn add_message(
            &self,
            chat_id: &str,
            role: Role,
            content: &str,
            sources: &[Source],
        ) -> Result<Message, RemoteError> {
            Self::fail(&self.fail_add)?;
            self.inner.add_message(chat_id, role, content, sources).await
        }

        async fn update_message(
            &self,
            chat_id: &str,
            message_id: &str,
            content: &str,
            sources: Option<&[Source]>,
        ) -> Result<Message, RemoteError> {
            Self::fail(&self.fail_update)?;
            self.inner
                .update_message(chat_id, message_id, content, sources)
                .await
        }

        async fn clear_messages(&self, chat_id: &str) -> Result<(), RemoteError> {
            self.clear_calls.fetch_add(1, Ordering::SeqCst);
            Self::fail(&self.fail_clear)?;
            self.inner.clear_messages(chat_id).await
        }
    }

    fn make_controller() -> (
        Arc<FlakyStore>,
        Arc<CannedAnswerEngine>,
        ConversationController,
    ) {
        let store = Arc::new(FlakyStore::new());
        let engine = Arc::new(CannedAnswerEngine::new());
        let controller = ConversationController::new(store.clone(), engine.clone());
        (store, engine, controller)
    }

    // ---- Lazy chat creation ----

    #[tokio::test]
    async fn test_first_message_creates_chat() {
        let (store, _, controller) = make_controller();
        let (message, chat_id) = controller.add_user_message("What is X?").await.unwrap();

        assert!(!message.id.is_pending());
        let chat_id = chat_id.unwrap();
        assert_eq!(controller.state().active_chat_id.as_deref(), Some(chat_id.as_str()));
        assert_eq!(store.inner.chat_count(), 1);

        let stored = store.inner.get_chat(&chat_id).await.unwrap();
        assert_eq!(stored.chat.title, "What is X?");
    }

    #[tokio::test]
    async fn test_second_message_reuses_chat() {
        let (store, _, controller) = make_controller();
        let (_, first_id) = controller.add_user_message("first").await.unwrap();
        let (_, second_id) = controller.add_user_message("second").await.unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(store.inner.chat_count(), 1);

        let state = controller.state();
        assert_eq!(state.message_count(), 2);
        assert!(state
            .messages
            .iter()
            .all(|m| m.chat_id == first_id.clone().unwrap()));
    }

    #[tokio::test]
    async fn test_assistant_first_creates_chat_with_default_title() {
        let (store, _, controller) = make_controller();
        let (_, chat_id) = controller
            .add_assistant_message("an answer", vec![], None)
            .await
            .unwrap();

        let stored = store.inner.get_chat(&chat_id.unwrap()).await.unwrap();
        assert_eq!(stored.chat.title, DEFAULT_CHAT_TITLE);
    }

    #[tokio::test]
    async fn test_assistant_message_uses_hint_over_active() {
        let (store, _, controller) = make_controller();
        let other = store.inner.create_chat("other", None).await.unwrap();
        controller.add_user_message("question").await.unwrap();

        let (_, used) = controller
            .add_assistant_message("answer", vec![], Some(&other.id))
            .await
            .unwrap();
        assert_eq!(used.as_deref(), Some(other.id.as_str()));

        let stored = store.inner.get_chat(&other.id).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_long_first_message_truncates_title() {
        let (store, _, controller) = make_controller();
        let question = "q".repeat(80);
        let (_, chat_id) = controller.add_user_message(&question).await.unwrap();
        let stored = store.inner.get_chat(&chat_id.unwrap()).await.unwrap();
        assert!(stored.chat.title.ends_with("..."));
        assert_eq!(stored.chat.title.chars().count(), 43);
    }

    // ---- Optimistic fallbacks ----

    #[tokio::test]
    async fn test_failed_write_appends_pending_message() {
        let (store, _, controller) = make_controller();
        controller.add_user_message("seed").await.unwrap();

        store.fail_add.store(true, Ordering::SeqCst);
        let (message, chat_id) = controller.add_user_message("kept anyway").await.unwrap();

        assert!(message.id.is_pending());
        assert!(chat_id.is_some());

        let state = controller.state();
        assert_eq!(state.message_count(), 2);
        assert_eq!(state.messages[1].content, "kept anyway");
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_failed_chat_creation_still_keeps_message() {
        let (store, _, controller) = make_controller();
        store.fail_create.store(true, Ordering::SeqCst);

        let (message, chat_id) = controller.add_user_message("orphaned").await.unwrap();
        assert!(message.id.is_pending());
        assert!(chat_id.is_none());
        assert!(controller.state().active_chat_id.is_none());
        assert_eq!(controller.state().message_count(), 1);
        assert_eq!(store.inner.chat_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_message_not_in_store() {
        let (store, _, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("persisted").await.unwrap();

        store.fail_add.store(true, Ordering::SeqCst);
        controller.add_user_message("pending only").await.unwrap();

        let stored = store.inner.get_chat(&chat_id.unwrap()).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(controller.state().message_count(), 2);
    }

    // ---- Edit in place ----

    #[tokio::test]
    async fn test_update_requires_active_chat() {
        let (_, _, controller) = make_controller();
        let err = controller
            .update_user_message(&MessageId::Persisted("m1".to_string()), "new")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NoActiveConversation));
        assert!(controller.state().last_error.is_some());
    }

    #[tokio::test]
    async fn test_update_preserves_position_and_id() {
        let (store, _, controller) = make_controller();
        let (first, chat_id) = controller.add_user_message("What is X").await.unwrap();
        controller
            .add_assistant_message("X is Y", vec![], chat_id.as_deref())
            .await
            .unwrap();

        controller
            .update_user_message(&first.id, "What is Z")
            .await
            .unwrap();

        let state = controller.state();
        assert_eq!(state.messages[0].content, "What is Z");
        assert_eq!(state.messages[0].id, first.id);
        assert!(state.messages[0].updated_at.is_some());

        // Reload from the store: the edit survived at the same index.
        controller.load_messages(&chat_id.unwrap()).await.unwrap();
        let state = controller.state();
        assert_eq!(state.messages[0].content, "What is Z");
        assert_eq!(state.messages[0].id, first.id);
    }

    #[tokio::test]
    async fn test_update_failure_applies_local_edit() {
        let (store, _, controller) = make_controller();
        let (first, _) = controller.add_user_message("original").await.unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        let err = controller
            .update_user_message(&first.id, "edited locally")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RemoteWrite(_)));

        let state = controller.state();
        assert_eq!(state.messages[0].content, "edited locally");
        assert_eq!(state.messages[0].id, first.id);
        assert!(state.last_error.is_some());

        // The store never saw the edit.
        store.fail_update.store(false, Ordering::SeqCst);
        let stored = store
            .inner
            .get_chat(&state.active_chat_id.unwrap())
            .await
            .unwrap();
        assert_eq!(stored.messages[0].content, "original");
    }

    #[tokio::test]
    async fn test_update_pending_message_stays_local() {
        let (store, _, controller) = make_controller();
        controller.add_user_message("seed").await.unwrap();
        store.fail_add.store(true, Ordering::SeqCst);
        let (pending, _) = controller.add_user_message("unsent").await.unwrap();

        store.fail_add.store(false, Ordering::SeqCst);
        controller
            .update_user_message(&pending.id, "edited pending")
            .await
            .unwrap();

        let state = controller.state();
        assert_eq!(state.messages[1].content, "edited pending");
        assert!(state.messages[1].id.is_pending());
    }

    // ---- Regeneration ----

    #[tokio::test]
    async fn test_regenerate_without_assistant_fails() {
        let (_, _, controller) = make_controller();
        controller.add_user_message("only a question").await.unwrap();
        let err = controller
            .regenerate_answer("new answer", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NoAssistantMessage));
    }

    #[tokio::test]
    async fn test_regenerate_targets_latest_assistant_only() {
        let (_, _, controller) = make_controller();
        controller
            .add_complete_exchange("q1", "a1", vec![])
            .await
            .unwrap();
        controller
            .add_complete_exchange("q2", "a2", vec![])
            .await
            .unwrap();

        controller
            .regenerate_answer("a2 regenerated", vec![])
            .await
            .unwrap();

        let state = controller.state();
        assert_eq!(state.messages[1].content, "a1");
        assert!(state.messages[1].updated_at.is_none());
        assert_eq!(state.messages[3].content, "a2 regenerated");
        assert!(state.messages[3].updated_at.is_some());
    }

    #[tokio::test]
    async fn test_regenerate_replaces_sources() {
        let (store, _, controller) = make_controller();
        let chat_id = controller
            .add_complete_exchange("q", "a", vec![])
            .await
            .unwrap()
            .unwrap();

        let sources = vec![Source::with_label("fresh snippet", "doc2.pdf")];
        controller
            .regenerate_answer("a regenerated", sources)
            .await
            .unwrap();

        let stored = store.inner.get_chat(&chat_id).await.unwrap();
        assert_eq!(stored.messages[1].content, "a regenerated");
        assert_eq!(stored.messages[1].sources.len(), 1);
        assert_eq!(stored.messages[1].sources[0].label(), Some("doc2.pdf"));
    }

    #[tokio::test]
    async fn test_regenerate_failure_mutates_locally() {
        let (store, _, controller) = make_controller();
        controller
            .add_complete_exchange("q", "a", vec![])
            .await
            .unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        let err = controller
            .regenerate_answer("local only", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RemoteWrite(_)));

        let state = controller.state();
        assert_eq!(state.messages[1].content, "local only");
        assert!(state.messages[1].updated_at.is_some());
    }

    // ---- Complete exchange ----

    #[tokio::test]
    async fn test_complete_exchange_scenario() {
        let (store, _, controller) = make_controller();
        let chat_id = controller
            .add_complete_exchange(
                "What is X?",
                "X is Y",
                vec![Source::with_label("X equals Y in context", "doc1.pdf")],
            )
            .await
            .unwrap()
            .unwrap();

        let stored = store.inner.get_chat(&chat_id).await.unwrap();
        assert_eq!(stored.chat.title, "What is X?");
        assert_eq!(stored.chat.message_count, 2);
        assert_eq!(stored.messages[0].role, Role::User);
        assert_eq!(stored.messages[1].role, Role::Assistant);
        assert_eq!(stored.messages[1].sources.len(), 1);
        assert_eq!(stored.messages[1].sources[0].label(), Some("doc1.pdf"));
    }

    #[tokio::test]
    async fn test_complete_exchange_partial_failure_keeps_user_turn() {
        let (store, _, controller) = make_controller();
        // First write lands, second fails: the chat holds only the user turn.
        let chat_id = {
            let (_, id) = controller.add_user_message("seed").await.unwrap();
            store.fail_add.store(true, Ordering::SeqCst);
            controller
                .add_assistant_message("never lands", vec![], id.as_deref())
                .await
                .unwrap();
            id.unwrap()
        };

        store.fail_add.store(false, Ordering::SeqCst);
        let stored = store.inner.get_chat(&chat_id).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].role, Role::User);
        // Locally both turns are visible.
        assert_eq!(controller.state().message_count(), 2);
    }

    // ---- Clear ----

    #[tokio::test]
    async fn test_clear_issues_one_clear_and_one_reset() {
        let (store, engine, controller) = make_controller();
        controller
            .add_complete_exchange("q", "a", vec![])
            .await
            .unwrap();

        controller.clear_conversation().await.unwrap();

        assert_eq!(store.clear_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.reset_count(), 1);
        assert!(controller.state().messages.is_empty());
    }

    #[tokio::test]
    async fn test_clear_without_active_chat_still_resets() {
        let (store, engine, controller) = make_controller();
        controller.clear_conversation().await.unwrap();
        assert_eq!(engine.reset_count(), 1);
        assert_eq!(store.clear_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_failure_still_empties_locally() {
        let (store, _, controller) = make_controller();
        controller
            .add_complete_exchange("q", "a", vec![])
            .await
            .unwrap();

        store.fail_clear.store(true, Ordering::SeqCst);
        let err = controller.clear_conversation().await.unwrap_err();
        assert!(matches!(err, ChatError::RemoteWrite(_)));
        assert!(controller.state().messages.is_empty());
        assert!(controller.state().last_error.is_some());
    }

    // ---- Load / switch ----

    #[tokio::test]
    async fn test_load_chat_same_id_is_noop() {
        let (_, engine, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("q").await.unwrap();
        let chat_id = chat_id.unwrap();

        let generation = controller.generation();
        controller.load_chat(&chat_id).await.unwrap();

        assert_eq!(engine.reset_count(), 0);
        assert_eq!(controller.generation(), generation);
        // The transcript is untouched by the no-op.
        assert_eq!(controller.state().message_count(), 1);
    }

    #[tokio::test]
    async fn test_load_chat_switch_resets_and_bumps_generation() {
        let (store, engine, controller) = make_controller();
        controller.add_user_message("in chat A").await.unwrap();

        let chat_b = store.inner.create_chat("chat B", None).await.unwrap();
        store
            .inner
            .add_message(&chat_b.id, Role::User, "in chat B", &[])
            .await
            .unwrap();

        let generation = controller.generation();
        controller.load_chat(&chat_b.id).await.unwrap();

        assert_eq!(engine.reset_count(), 1);
        assert_eq!(controller.generation(), generation + 1);

        let state = controller.state();
        assert_eq!(state.active_chat_id.as_deref(), Some(chat_b.id.as_str()));
        assert_eq!(state.message_count(), 1);
        assert_eq!(state.messages[0].content, "in chat B");
    }

    #[tokio::test]
    async fn test_load_messages_failure_clears_transcript() {
        let (store, _, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("q").await.unwrap();

        store.fail_get.store(true, Ordering::SeqCst);
        let err = controller
            .load_messages(&chat_id.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RemoteFetch(_)));

        let state = controller.state();
        assert!(state.messages.is_empty());
        assert!(state.last_error.is_some());
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_load_unknown_chat_is_fetch_error() {
        let (_, _, controller) = make_controller();
        let err = controller.load_messages("missing").await.unwrap_err();
        assert!(matches!(err, ChatError::RemoteFetch(_)));
    }

    // ---- Delete ----

    #[tokio::test]
    async fn test_delete_active_chat_resets_state() {
        let (store, engine, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("q").await.unwrap();
        let chat_id = chat_id.unwrap();

        let generation = controller.generation();
        controller.delete_chat(&chat_id).await.unwrap();

        let state = controller.state();
        assert!(state.active_chat_id.is_none());
        assert!(state.messages.is_empty());
        assert_eq!(engine.reset_count(), 1);
        assert_eq!(controller.generation(), generation + 1);
        assert_eq!(store.inner.chat_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_other_chat_keeps_state() {
        let (store, engine, controller) = make_controller();
        controller.add_user_message("active q").await.unwrap();
        let other = store.inner.create_chat("other", None).await.unwrap();

        controller.delete_chat(&other.id).await.unwrap();

        let state = controller.state();
        assert!(state.active_chat_id.is_some());
        assert_eq!(state.message_count(), 1);
        assert_eq!(engine.reset_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_failure_reports_error() {
        let (store, _, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("q").await.unwrap();

        store.fail_delete.store(true, Ordering::SeqCst);
        let err = controller.delete_chat(&chat_id.unwrap()).await.unwrap_err();
        assert!(matches!(err, ChatError::RemoteWrite(_)));
        assert!(controller.state().active_chat_id.is_some());
    }

    // ---- Rename ----

    #[tokio::test]
    async fn test_rename_chat_passthrough() {
        let (store, _, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("q").await.unwrap();
        let chat_id = chat_id.unwrap();

        let renamed = controller.rename_chat(&chat_id, "Better title").await.unwrap();
        assert_eq!(renamed.title, "Better title");

        let stored = store.inner.get_chat(&chat_id).await.unwrap();
        assert_eq!(stored.chat.title, "Better title");
    }

    #[tokio::test]
    async fn test_rename_failure() {
        let (store, _, controller) = make_controller();
        let (_, chat_id) = controller.add_user_message("q").await.unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        let err = controller
            .rename_chat(&chat_id.unwrap(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RemoteWrite(_)));
    }

    // ---- Last question ----

    #[tokio::test]
    async fn test_last_question_empty_initially() {
        let (_, _, controller) = make_controller();
        assert_eq!(controller.last_question(), "");
    }

    #[tokio::test]
    async fn test_last_question_returns_latest_user_turn() {
        let (_, _, controller) = make_controller();
        controller
            .add_complete_exchange("first", "a1", vec![])
            .await
            .unwrap();
        controller.add_user_message("second").await.unwrap();
        assert_eq!(controller.last_question(), "second");
    }

    // ---- Events ----

    #[tokio::test]
    async fn test_events_published_on_first_message() {
        let (_, _, controller) = make_controller();
        let mut rx = controller.subscribe();

        controller.add_user_message("hello").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_name(), "chat_created");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_name(), "message_appended");
    }

    #[tokio::test]
    async fn test_pending_flag_in_append_event() {
        let (store, _, controller) = make_controller();
        controller.add_user_message("seed").await.unwrap();
        let mut rx = controller.subscribe();

        store.fail_add.store(true, Ordering::SeqCst);
        controller.add_user_message("unsent").await.unwrap();

        let event = rx.recv().await.unwrap();
        match event {
            ConversationEvent::MessageAppended { pending, .. } => assert!(pending),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

//! Client active-request tracker.
//!
//! Starts sessions against the relay and mirrors their progress into the
//! local replica. A chat has at most one outstanding request; its
//! `active_requests` row exists exactly while the client believes the
//! server-side session is running, and is removed on every terminal event,
//! on stop, and on transport failure.

use crate::api::{EventStream, RelayClient};
use crate::error::ClientError;
use crate::replica::{ActiveRequest, Replica};
use dashmap::DashMap;
use futures::StreamExt;
use service_core::protocol::{
    Attachment, Chat, ChatEvent, ChatRequest, GenerateTitleRequest, Message, ModelSelection,
    Role, STOPPED_MARKER,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How a tracked request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The server closed the stream; carries the full assistant text.
    Finished(String),
    /// Interrupted locally through [`Tracker::stop`].
    Stopped,
}

/// Handle to a request whose response is being consumed in the background.
pub struct RequestHandle {
    pub request_id: String,
    pub chat_id: String,
    task: JoinHandle<Result<RequestOutcome, ClientError>>,
}

impl RequestHandle {
    /// Wait until the response is fully applied to the replica.
    pub async fn wait(self) -> Result<RequestOutcome, ClientError> {
        self.task.await?
    }
}

/// Local side of a running request.
struct Consumer {
    request_id: String,
    cancel: CancellationToken,
    /// Held while an event is applied, so `stop` never interleaves with a
    /// replica write.
    writing: Arc<Mutex<()>>,
    /// Messages in the chat before the assistant turn began.
    history_len: usize,
    model_id: String,
}

/// What a consumer needs to rebuild the assistant turn on every event.
struct Session {
    chat_id: String,
    request_id: String,
    model_id: String,
    history: Vec<Message>,
    derive_title: bool,
}

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

struct Inner {
    api: RelayClient,
    replica: Replica,
    consumers: DashMap<String, Consumer>,
}

impl Tracker {
    /// Create a tracker, dropping requests left behind by a previous process.
    pub async fn new(api: RelayClient, replica: Replica) -> Result<Self, ClientError> {
        let stale = replica.clear_active_requests().await?;
        if stale > 0 {
            warn!(count = stale, "Cleared stale active requests");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                api,
                replica,
                consumers: DashMap::new(),
            }),
        })
    }

    pub fn replica(&self) -> &Replica {
        &self.inner.replica
    }

    pub async fn is_active(&self, chat_id: &str) -> Result<bool, ClientError> {
        Ok(self
            .inner
            .replica
            .active_request_for_chat(chat_id)
            .await?
            .is_some())
    }

    /// Replace the replica's chats and models with the server's.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<(), ClientError> {
        let snapshot = self.inner.api.sync().await?;
        self.inner
            .replica
            .replace_all(&snapshot.chats, &snapshot.models)
            .await?;
        info!(
            chats = snapshot.chats.len(),
            models = snapshot.models.len(),
            "Replica synchronized"
        );
        Ok(())
    }

    /// Append a user message to a chat (creating it if new) and stream the
    /// reply.
    #[instrument(skip(self, content, attachments, model), fields(model_id = %model.id))]
    pub async fn send(
        &self,
        chat_id: &str,
        model: &ModelSelection,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<RequestHandle, ClientError> {
        self.ensure_idle(chat_id).await?;

        let mut chat = match self.inner.replica.get_chat(chat_id).await? {
            Some(chat) => chat,
            None => Chat::new(chat_id, self.inner.api.user_id()),
        };

        // The user message shares its id with the request that carries it.
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut message = Message::user(request_id.clone(), content);
        message.attachments = attachments;
        chat.messages.push(message);

        self.inner.replica.upsert_chat(&chat).await?;
        self.start(chat, request_id, model).await
    }

    /// Re-ask from the point just before `message_id`.
    ///
    /// Returns `None` when nothing precedes the message.
    #[instrument(skip(self, model))]
    pub async fn regenerate(
        &self,
        message_id: &str,
        model: &ModelSelection,
    ) -> Result<Option<RequestHandle>, ClientError> {
        let (mut chat, index) = self.locate(message_id).await?;
        if index == 0 {
            return Ok(None);
        }
        self.ensure_idle(&chat.id).await?;

        chat.messages.truncate(index);
        self.inner
            .replica
            .update_chat_messages(&chat.id, &chat.messages)
            .await?;

        let request_id = uuid::Uuid::new_v4().to_string();
        self.start(chat, request_id, model).await.map(Some)
    }

    /// Rewrite a user message, drop everything after it and stream a new
    /// reply.
    #[instrument(skip(self, content, model))]
    pub async fn edit(
        &self,
        message_id: &str,
        content: &str,
        model: &ModelSelection,
    ) -> Result<RequestHandle, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::InvalidInput("message is empty".to_string()));
        }

        let (mut chat, index) = self.locate(message_id).await?;
        if chat.messages[index].role != Role::User {
            return Err(ClientError::InvalidInput(
                "only user messages can be edited".to_string(),
            ));
        }
        self.ensure_idle(&chat.id).await?;

        chat.messages.truncate(index + 1);
        chat.messages[index].content = content.to_string();
        self.inner
            .replica
            .update_chat_messages(&chat.id, &chat.messages)
            .await?;

        let request_id = uuid::Uuid::new_v4().to_string();
        self.start(chat, request_id, model).await
    }

    /// Interrupt the chat's outstanding request.
    ///
    /// Returns false, doing nothing, when the chat has none.
    #[instrument(skip(self))]
    pub async fn stop(&self, chat_id: &str) -> Result<bool, ClientError> {
        let Some(active) = self.inner.replica.active_request_for_chat(chat_id).await? else {
            return Ok(false);
        };

        let consumer = self
            .inner
            .consumers
            .remove_if(chat_id, |_, c| c.request_id == active.request_id)
            .map(|(_, c)| c);
        let _writing = match &consumer {
            Some(consumer) => {
                consumer.cancel.cancel();
                Some(consumer.writing.clone().lock_owned().await)
            }
            None => None,
        };

        // The response may have finished while we waited for the consumer.
        if self.inner.replica.active_request_for_chat(chat_id).await? != Some(active.clone()) {
            return Ok(false);
        }

        match self.inner.api.stop(chat_id).await {
            Ok(true) => debug!("Server session cancelled"),
            Ok(false) => debug!("Server had no running session"),
            Err(e) => warn!(error = %e, "Failed to cancel server session"),
        }

        let marked = self.mark_stopped(chat_id, consumer.as_ref()).await;
        let removed = self
            .inner
            .replica
            .remove_active_request(&active.request_id)
            .await;
        marked?;
        removed?;
        info!(request_id = %active.request_id, "Request stopped");
        Ok(true)
    }

    /// Close the interrupted assistant turn with the stop marker, as the
    /// server does.
    ///
    /// Before the first event there is no assistant turn of this request in
    /// the replica, so a marker-only reply is appended instead of touching an
    /// older answer.
    async fn mark_stopped(
        &self,
        chat_id: &str,
        consumer: Option<&Consumer>,
    ) -> Result<(), ClientError> {
        let Some(mut chat) = self.inner.replica.get_chat(chat_id).await? else {
            return Ok(());
        };

        let streaming = consumer.map_or(true, |c| chat.messages.len() > c.history_len);
        match chat
            .messages
            .last_mut()
            .filter(|m| streaming && m.role == Role::Assistant)
        {
            Some(last) => last.content.push_str(STOPPED_MARKER),
            None => {
                if let Some(consumer) = consumer {
                    chat.messages.truncate(consumer.history_len);
                }
                let model_id = consumer.map(|c| c.model_id.clone());
                chat.messages.push(Message::assistant(STOPPED_MARKER, model_id));
            }
        }

        self.inner
            .replica
            .update_chat_messages(chat_id, &chat.messages)
            .await?;
        Ok(())
    }

    /// Drop a request's row, logging rather than failing when that is not
    /// possible.
    async fn release(&self, request_id: &str) {
        if let Err(e) = self.inner.replica.remove_active_request(request_id).await {
            warn!(error = %e, request_id, "Failed to clear active request");
        }
    }

    async fn ensure_idle(&self, chat_id: &str) -> Result<(), ClientError> {
        if self.is_active(chat_id).await? {
            return Err(ClientError::AlreadyActive(chat_id.to_string()));
        }
        Ok(())
    }

    async fn locate(&self, message_id: &str) -> Result<(Chat, usize), ClientError> {
        let chat = self
            .inner
            .replica
            .find_chat_by_message(message_id)
            .await?
            .ok_or_else(|| ClientError::MessageNotFound(message_id.to_string()))?;
        let index = chat
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| ClientError::MessageNotFound(message_id.to_string()))?;
        Ok((chat, index))
    }

    /// Record the request, open its stream and hand it to a consumer task.
    async fn start(
        &self,
        chat: Chat,
        request_id: String,
        model: &ModelSelection,
    ) -> Result<RequestHandle, ClientError> {
        let active = ActiveRequest {
            request_id: request_id.clone(),
            chat_id: chat.id.clone(),
        };
        self.inner.replica.add_active_request(&active).await?;

        let body = ChatRequest {
            chat_id: chat.id.clone(),
            request_id: request_id.clone(),
            model: model.clone(),
            messages: chat.messages.clone(),
        };
        let events = match self.inner.api.chat(&body).await {
            Ok(events) => events,
            Err(e) => {
                self.release(&request_id).await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let writing = Arc::new(Mutex::new(()));
        self.inner.consumers.insert(
            chat.id.clone(),
            Consumer {
                request_id: request_id.clone(),
                cancel: cancel.clone(),
                writing: writing.clone(),
                history_len: chat.messages.len(),
                model_id: model.id.clone(),
            },
        );

        let derive_title = chat.has_sentinel_title()
            && !chat.messages.iter().any(|m| m.role == Role::Assistant);
        let session = Session {
            chat_id: chat.id.clone(),
            request_id: request_id.clone(),
            model_id: model.id.clone(),
            history: chat.messages,
            derive_title,
        };

        let tracker = self.clone();
        let task = tokio::spawn(async move {
            let outcome = tracker.consume(&session, events, cancel, writing).await;
            tracker
                .inner
                .consumers
                .remove_if(&session.chat_id, |_, c| c.request_id == session.request_id);
            outcome
        });

        Ok(RequestHandle {
            request_id,
            chat_id: active.chat_id,
            task,
        })
    }

    #[instrument(skip_all, fields(chat_id = %session.chat_id, request_id = %session.request_id))]
    async fn consume(
        &self,
        session: &Session,
        mut events: EventStream,
        cancel: CancellationToken,
        writing: Arc<Mutex<()>>,
    ) -> Result<RequestOutcome, ClientError> {
        let mut assistant = Message::assistant("", Some(session.model_id.clone()));
        let mut messages = session.history.clone();
        let mut streamed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RequestOutcome::Stopped),
                next = events.next() => next,
            };

            let _guard = writing.lock().await;
            if cancel.is_cancelled() {
                return Ok(RequestOutcome::Stopped);
            }

            // Release under the write lock; stop rechecks the row after taking it.
            match self.apply(session, next, &mut assistant, &mut messages).await {
                Ok(true) => break,
                Ok(false) => streamed = true,
                Err(e) => {
                    self.release(&session.request_id).await;
                    return Err(e);
                }
            }
        }

        // A bare terminal event is a server-side failure; nothing to title.
        if session.derive_title && streamed {
            self.derive_title(session, &messages).await;
        }
        Ok(RequestOutcome::Finished(assistant.content))
    }

    /// Mirror one stream item into the replica. Returns true on the terminal
    /// event.
    async fn apply(
        &self,
        session: &Session,
        next: Option<Result<ChatEvent, ClientError>>,
        assistant: &mut Message,
        messages: &mut Vec<Message>,
    ) -> Result<bool, ClientError> {
        let replica = &self.inner.replica;
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "Response stream failed");
                return Err(e);
            }
            None => {
                warn!("Response stream closed without a terminal event");
                return Err(ClientError::StreamClosed);
            }
        };

        if let Some(content) = &event.content {
            assistant.content.push_str(content);
        }
        messages.truncate(session.history.len());
        messages.push(assistant.clone());
        if !replica
            .update_chat_messages(&session.chat_id, messages)
            .await?
        {
            warn!("Chat vanished from the replica mid-response");
            return Err(ClientError::ChatNotFound(session.chat_id.clone()));
        }

        if event.done {
            replica.remove_active_request(&session.request_id).await?;
            debug!(chars = assistant.content.len(), "Response complete");
            return Ok(true);
        }
        Ok(false)
    }

    /// Ask the server for a title and mirror whatever it settles on.
    async fn derive_title(&self, session: &Session, messages: &[Message]) {
        let Ok(Some(chat)) = self.inner.replica.get_chat(&session.chat_id).await else {
            return;
        };
        if !chat.has_sentinel_title() {
            return;
        }

        let request = GenerateTitleRequest {
            chat_id: session.chat_id.clone(),
            model_id: session.model_id.clone(),
            messages: messages.iter().take(2).cloned().collect(),
        };
        match self.inner.api.generate_title(&request).await {
            Ok(response) => {
                if let Err(e) = self
                    .inner
                    .replica
                    .update_chat_title(&session.chat_id, &response.title)
                    .await
                {
                    warn!(error = %e, "Failed to store chat title");
                }
            }
            Err(e) => warn!(error = %e, "Title generation failed"),
        }
    }
}

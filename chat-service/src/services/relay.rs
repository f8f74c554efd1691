//! Relay orchestrator.
//!
//! Each accepted chat request becomes one session task. The task streams
//! the upstream completion to the client over a channel and persists exactly
//! one assistant message when the session completes or is aborted.

use super::credentials::{CredentialStore, ModelCredentials};
use super::metrics;
use super::providers::{
    ChatProvider, CompletionRequest, ProviderError, SamplingParams, UpstreamMessage,
};
use super::registry::{RegistryError, SessionGuard, SessionRegistry};
use super::store::ChatStore;
use dashmap::DashMap;
use futures::StreamExt;
use service_core::error::AppError;
use service_core::protocol::{
    error_content, ChatEvent, ChatRequest, GenerateTitleResponse, Message, Role, STOPPED_MARKER,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const TITLE_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that generates concise conversation titles.";
const TITLE_PROMPT_PREFIX: &str = "Summarize the following conversation in a single sentence of 5-10 words, capturing the main topic or purpose:\n\n";
const TITLE_MAX_TOKENS: u32 = 20;
const TITLE_TEMPERATURE: f32 = 0.5;

const GENERIC_ERROR: &str = "An error occurred.";
const EVENT_BUFFER: usize = 64;

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Completed,
    Aborted,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Errored => "errored",
        }
    }
}

/// Everything a session needs, taken from one client request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub chat_id: String,
    pub request_id: String,
    pub user_id: String,
    pub model_id: String,
    pub custom_instructions: String,
    /// Client's snapshot of the conversation, ending with the new turn.
    pub messages: Vec<Message>,
}

impl SessionRequest {
    pub fn new(body: ChatRequest, user_id: impl Into<String>) -> Self {
        Self {
            chat_id: body.chat_id,
            request_id: body.request_id,
            user_id: user_id.into(),
            model_id: body.model.id,
            custom_instructions: body.model.custom_instructions,
            messages: body.messages,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub system_prompt: String,
    pub auto_title: bool,
}

enum Ending {
    Completed,
    Aborted,
    Failed(ProviderError),
}

#[derive(Clone)]
pub struct RelayService {
    store: Arc<dyn ChatStore>,
    credentials: Arc<dyn CredentialStore>,
    provider: Arc<dyn ChatProvider>,
    registry: SessionRegistry,
    /// Per-chat title slot; the flag records that an upstream attempt was made.
    title_attempts: Arc<DashMap<String, Arc<Mutex<bool>>>>,
    settings: Arc<RelaySettings>,
}

impl RelayService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        credentials: Arc<dyn CredentialStore>,
        provider: Arc<dyn ChatProvider>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            credentials,
            provider,
            registry: SessionRegistry::new(),
            title_attempts: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Start a session and return its outbound event stream.
    ///
    /// The stream always ends with exactly one `done: true` event unless the
    /// receiver is dropped first, which aborts the session.
    pub fn run_session(&self, request: SessionRequest) -> ReceiverStream<ChatEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!(
            "relay_session",
            chat_id = %request.chat_id,
            request_id = %request.request_id,
            model_id = %request.model_id,
        );

        let relay = self.clone();
        tokio::spawn(async move { relay.drive(request, tx).await }.instrument(span));

        ReceiverStream::new(rx)
    }

    /// Request cancellation of the chat's running session.
    pub fn cancel(&self, chat_id: &str) -> Result<(), RegistryError> {
        self.registry.cancel(chat_id)
    }

    async fn drive(self, request: SessionRequest, tx: mpsc::Sender<ChatEvent>) {
        let chat = match self
            .store
            .get_or_create(&request.chat_id, &request.user_id)
            .await
        {
            Ok(chat) => chat,
            Err(e) => {
                tracing::error!(error = %e, "Failed to resolve chat");
                reject(&tx, &request.request_id, GENERIC_ERROR).await;
                return;
            }
        };

        if chat.created_by != request.user_id {
            tracing::warn!(user_id = %request.user_id, "Chat belongs to another user");
            reject(&tx, &request.request_id, "Chat not found.").await;
            return;
        }

        let model = match self.credentials.get_model(&request.model_id).await {
            Ok(Some(model)) => model,
            Ok(None) => {
                let err = ProviderError::ModelNotFound(request.model_id.clone());
                tracing::warn!(error = %err, "Rejecting session");
                metrics::record_upstream_error(err.category());
                reject(&tx, &request.request_id, err.user_message()).await;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Credential lookup failed");
                reject(&tx, &request.request_id, GENERIC_ERROR).await;
                return;
            }
        };

        let upstream = self.build_request(&request);

        let guard = match self.registry.register(
            &request.chat_id,
            &request.request_id,
            CancellationToken::new(),
        ) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting concurrent session");
                metrics::record_session_outcome("rejected");
                reject(&tx, &request.request_id, &e.to_string()).await;
                return;
            }
        };

        // Only the first assistant turn of an untitled chat earns a title.
        let wants_title = self.settings.auto_title
            && chat.has_sentinel_title()
            && !request.messages.iter().any(|m| m.role == Role::Assistant);

        metrics::session_started();
        let state = self
            .relay(&request, &model, &upstream, guard, &tx, wants_title)
            .await;
        metrics::session_finished(state.as_str());
        tracing::info!(outcome = state.as_str(), "Session finished");
    }

    /// Stream one registered session to its terminal state. Consumes the
    /// guard so the chat is released before the final event goes out.
    async fn relay(
        &self,
        request: &SessionRequest,
        model: &ModelCredentials,
        upstream: &CompletionRequest,
        guard: SessionGuard,
        tx: &mpsc::Sender<ChatEvent>,
        wants_title: bool,
    ) -> SessionState {
        let request_id = request.request_id.as_str();
        let token = guard.token().clone();

        let started = tokio::select! {
            biased;
            _ = tx.closed() => Err(ProviderError::Cancelled),
            result = self.provider.stream_chat(model, upstream, &token) => result,
        };

        let mut stream = match started {
            Ok(stream) => stream,
            Err(ProviderError::Cancelled) => {
                return self.finish_aborted(request, String::new(), guard, tx).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Upstream request failed");
                metrics::record_upstream_error(e.category());
                drop(guard);
                reject(tx, request_id, e.user_message()).await;
                return SessionState::Errored;
            }
        };

        let mut accumulated = String::new();
        let ending = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ending::Aborted,
                _ = tx.closed() => break Ending::Aborted,
                next = stream.next() => match next {
                    Some(Ok(event)) if event.done => break Ending::Completed,
                    Some(Ok(event)) => {
                        if event.content.is_empty() {
                            continue;
                        }
                        accumulated.push_str(&event.content);
                        metrics::record_token(&model.id);
                        if !emit(tx, &token, ChatEvent::token(request_id, event.content)).await {
                            break Ending::Aborted;
                        }
                    }
                    Some(Err(e)) => break Ending::Failed(e),
                    // Upstream closed without a terminal line.
                    None => break Ending::Completed,
                },
            }
        };
        drop(stream);

        match ending {
            Ending::Completed => {
                let mut messages = request.messages.clone();
                messages.push(Message::assistant(
                    accumulated,
                    Some(request.model_id.clone()),
                ));
                self.persist(&request.chat_id, &messages).await;
                drop(guard);

                let _ = tx.send(ChatEvent::finished(request_id, "")).await;

                if wants_title {
                    self.spawn_auto_title(request, messages);
                }
                SessionState::Completed
            }
            Ending::Aborted => self.finish_aborted(request, accumulated, guard, tx).await,
            Ending::Failed(e) => {
                tracing::warn!(error = %e, streamed = accumulated.len(), "Upstream stream failed");
                metrics::record_upstream_error(e.category());
                let tail = format!("\n\n{}", error_content(e.user_message()));

                if !accumulated.is_empty() {
                    let mut messages = request.messages.clone();
                    messages.push(Message::assistant(
                        accumulated + &tail,
                        Some(request.model_id.clone()),
                    ));
                    self.persist(&request.chat_id, &messages).await;
                    drop(guard);
                    let _ = tx.send(ChatEvent::finished(request_id, tail)).await;
                } else {
                    drop(guard);
                    reject(tx, request_id, e.user_message()).await;
                }
                SessionState::Errored
            }
        }
    }

    async fn finish_aborted(
        &self,
        request: &SessionRequest,
        accumulated: String,
        guard: SessionGuard,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> SessionState {
        guard.token().cancel();

        let mut messages = request.messages.clone();
        messages.push(Message::assistant(
            accumulated + STOPPED_MARKER,
            Some(request.model_id.clone()),
        ));
        self.persist(&request.chat_id, &messages).await;
        drop(guard);

        // Reaches the client only when the stop came from elsewhere.
        let _ = tx
            .send(ChatEvent::finished(&request.request_id, STOPPED_MARKER))
            .await;
        SessionState::Aborted
    }

    async fn persist(&self, chat_id: &str, messages: &[Message]) {
        if let Err(e) = self.store.save_messages(chat_id, messages).await {
            tracing::error!(error = %e, "Failed to persist chat messages");
        }
    }

    fn build_request(&self, request: &SessionRequest) -> CompletionRequest {
        let mut system = self.settings.system_prompt.clone();
        let custom = request.custom_instructions.trim();
        if !custom.is_empty() {
            system.push_str("\n\n");
            system.push_str(custom);
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(UpstreamMessage::system(system));
        messages.extend(request.messages.iter().map(UpstreamMessage::from));

        CompletionRequest {
            messages,
            params: SamplingParams::default(),
        }
    }

    fn spawn_auto_title(&self, request: &SessionRequest, messages: Vec<Message>) {
        let relay = self.clone();
        let chat_id = request.chat_id.clone();
        let model_id = request.model_id.clone();
        let exchange: Vec<Message> = messages.into_iter().take(2).collect();

        tokio::spawn(
            async move {
                match relay.generate_title(&chat_id, &model_id, &exchange).await {
                    Ok(outcome) => {
                        tracing::info!(title = %outcome.title, generated = outcome.generated, "Automatic title done")
                    }
                    Err(e) => tracing::warn!(error = %e, "Automatic title generation failed"),
                }
            }
            .in_current_span(),
        );
    }

    /// Derive a short title for a chat that still has the sentinel title.
    ///
    /// Runs under a per-chat lock. A caller that finds the title already set
    /// gets it back with `generated: false`. Only one upstream attempt is made
    /// per chat: after a failed attempt later callers get the sentinel back
    /// without another call.
    pub async fn generate_title(
        &self,
        chat_id: &str,
        model_id: &str,
        messages: &[Message],
    ) -> Result<GenerateTitleResponse, AppError> {
        self.store
            .get(chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Chat not found.")))?;

        let slot = self
            .title_attempts
            .entry(chat_id.to_string())
            .or_default()
            .clone();
        let mut attempted = slot.lock().await;

        self.generate_title_locked(chat_id, model_id, messages, &mut attempted)
            .await
    }

    /// Drop per-chat title state once a chat is deleted.
    pub fn forget_chat(&self, chat_id: &str) {
        self.title_attempts.remove(chat_id);
    }

    async fn generate_title_locked(
        &self,
        chat_id: &str,
        model_id: &str,
        messages: &[Message],
        attempted: &mut bool,
    ) -> Result<GenerateTitleResponse, AppError> {
        let chat = self
            .store
            .get(chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Chat not found.")))?;

        if !chat.has_sentinel_title() || *attempted {
            metrics::record_title_generation("skipped");
            return Ok(GenerateTitleResponse {
                title: chat.title,
                generated: false,
            });
        }

        let model = self
            .credentials
            .get_model(model_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Model not found.")))?;

        *attempted = true;
        let raw = self
            .provider
            .complete(&model, &title_request(messages))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Title completion failed");
                metrics::record_title_generation("failed");
                metrics::record_upstream_error(e.category());
                AppError::BadGateway(e.user_message().to_string())
            })?;

        let title = clean_title(&raw);
        if title.is_empty() {
            metrics::record_title_generation("failed");
            return Err(AppError::BadGateway("Failed to generate title.".to_string()));
        }

        if self.store.set_title_if_sentinel(chat_id, &title).await? {
            metrics::record_title_generation("generated");
            return Ok(GenerateTitleResponse {
                title,
                generated: true,
            });
        }

        // Renamed while the completion was in flight.
        metrics::record_title_generation("skipped");
        let current = self.store.get(chat_id).await?.map(|c| c.title);
        Ok(GenerateTitleResponse {
            title: current.unwrap_or(title),
            generated: false,
        })
    }
}

async fn reject(tx: &mpsc::Sender<ChatEvent>, request_id: &str, message: &str) {
    let _ = tx.send(ChatEvent::error(request_id, message)).await;
}

/// Send unless the session is cancelled first. False means stop streaming.
async fn emit(tx: &mpsc::Sender<ChatEvent>, token: &CancellationToken, event: ChatEvent) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

fn title_request(messages: &[Message]) -> CompletionRequest {
    let conversation = messages
        .iter()
        .map(|m| {
            let speaker = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    CompletionRequest {
        messages: vec![
            UpstreamMessage::system(TITLE_SYSTEM_PROMPT),
            UpstreamMessage::user(format!("{}{}", TITLE_PROMPT_PREFIX, conversation)),
        ],
        params: SamplingParams {
            max_tokens: Some(TITLE_MAX_TOKENS),
            temperature: Some(TITLE_TEMPERATURE),
        },
    }
}

fn clean_title(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::services::credentials::ConfigCredentialStore;
    use crate::services::decoder::DecodedEvent;
    use crate::services::providers::mock::{MockChatProvider, MockStream};
    use crate::services::providers::{ContentPart, UpstreamContent};
    use crate::services::store::MemoryChatStore;
    use secrecy::Secret;
    use service_core::protocol::{Attachment, ModelSelection, SENTINEL_TITLE};
    use std::time::Duration;

    const USER: &str = "u1";

    struct Harness {
        relay: RelayService,
        store: Arc<MemoryChatStore>,
        provider: Arc<MockChatProvider>,
    }

    fn harness(auto_title: bool) -> Harness {
        let store = Arc::new(MemoryChatStore::new());
        let provider = Arc::new(MockChatProvider::new());
        let credentials = Arc::new(ConfigCredentialStore::new(&[ModelConfig {
            id: "fast".to_string(),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            api_url: "http://upstream.invalid/v1".to_string(),
            api_key: Secret::new("sk-test".to_string()),
        }]));
        let relay = RelayService::new(
            store.clone(),
            credentials,
            provider.clone(),
            RelaySettings {
                system_prompt: "Be helpful.".to_string(),
                auto_title,
            },
        );
        Harness {
            relay,
            store,
            provider,
        }
    }

    fn request(chat_id: &str, request_id: &str, content: &str) -> SessionRequest {
        SessionRequest::new(
            ChatRequest {
                chat_id: chat_id.to_string(),
                request_id: request_id.to_string(),
                model: ModelSelection {
                    id: "fast".to_string(),
                    custom_instructions: String::new(),
                },
                messages: vec![Message::user(request_id, content)],
            },
            USER,
        )
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn completion_relays_tokens_and_persists_one_assistant_message() {
        let h = harness(false);
        h.provider.push_stream(MockStream::tokens(&["Hel", "lo"]));

        let events: Vec<ChatEvent> = h.relay.run_session(request("c1", "r1", "Hello")).collect().await;

        assert_eq!(
            events,
            vec![
                ChatEvent::token("r1", "Hel"),
                ChatEvent::token("r1", "lo"),
                ChatEvent::finished("r1", ""),
            ]
        );
        let chat = h.store.get("c1").await.unwrap().unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[1].role, Role::Assistant);
        assert_eq!(chat.messages[1].content, "Hello");
        assert_eq!(chat.messages[1].model_id.as_deref(), Some("fast"));
        assert!(!h.relay.registry().is_running("c1"));
    }

    #[tokio::test]
    async fn cancel_persists_partial_content_with_stopped_marker() {
        let h = harness(false);
        let (stream, upstream) = MockStream::live();
        h.provider.push_stream(stream);

        let mut events = h.relay.run_session(request("c1", "r1", "Hello"));
        upstream.send(Ok(DecodedEvent::token("Hel"))).await.unwrap();
        upstream.send(Ok(DecodedEvent::token("lo "))).await.unwrap();
        assert_eq!(events.next().await, Some(ChatEvent::token("r1", "Hel")));
        assert_eq!(events.next().await, Some(ChatEvent::token("r1", "lo ")));

        h.relay.cancel("c1").unwrap();

        assert_eq!(
            events.next().await,
            Some(ChatEvent::finished("r1", STOPPED_MARKER))
        );
        assert_eq!(events.next().await, None);
        let chat = h.store.get("c1").await.unwrap().unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[1].content, "Hello \n\n**⛔ Stopped**");
        assert!(!h.relay.registry().is_running("c1"));
    }

    #[tokio::test]
    async fn client_disconnect_aborts_and_persists_once() {
        let h = harness(false);
        let (stream, upstream) = MockStream::live();
        h.provider.push_stream(stream);

        let mut events = h.relay.run_session(request("c1", "r1", "Hello"));
        upstream.send(Ok(DecodedEvent::token("Hel"))).await.unwrap();
        assert_eq!(events.next().await, Some(ChatEvent::token("r1", "Hel")));
        drop(events);

        let registry = h.relay.registry().clone();
        eventually(|| {
            let registry = registry.clone();
            async move { !registry.is_running("c1") }
        })
        .await;

        let chat = h.store.get("c1").await.unwrap().unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[1].content, format!("Hel{}", STOPPED_MARKER));
    }

    #[tokio::test]
    async fn rate_limited_upstream_yields_single_error_and_persists_nothing() {
        let h = harness(false);
        h.provider.push_stream(MockStream::Fail(ProviderError::Status {
            status: 429,
            body: "slow down".to_string(),
        }));

        let events: Vec<ChatEvent> = h.relay.run_session(request("c1", "r1", "Hello")).collect().await;

        assert_eq!(events, vec![ChatEvent::error("r1", "Rate limit exceeded.")]);
        let chat = h.store.get("c1").await.unwrap().unwrap();
        assert!(chat.messages.is_empty());
        assert!(!h.relay.registry().is_running("c1"));
    }

    #[tokio::test]
    async fn unknown_model_fails_before_upstream_call() {
        let h = harness(false);
        let mut req = request("c1", "r1", "Hello");
        req.model_id = "missing".to_string();

        let events: Vec<ChatEvent> = h.relay.run_session(req).collect().await;

        assert_eq!(events, vec![ChatEvent::error("r1", "Model not found.")]);
        assert_eq!(h.provider.stream_calls(), 0);
    }

    #[tokio::test]
    async fn second_request_for_running_chat_is_rejected() {
        let h = harness(false);
        let (stream, upstream) = MockStream::live();
        h.provider.push_stream(stream);

        let mut first = h.relay.run_session(request("c1", "r1", "Hello"));
        upstream.send(Ok(DecodedEvent::token("a"))).await.unwrap();
        assert_eq!(first.next().await, Some(ChatEvent::token("r1", "a")));

        let second: Vec<ChatEvent> = h.relay.run_session(request("c1", "r2", "Again")).collect().await;

        assert_eq!(
            second,
            vec![ChatEvent::error(
                "r2",
                "A response is already being generated for this chat."
            )]
        );
        assert_eq!(h.provider.stream_calls(), 1);

        upstream.send(Ok(DecodedEvent::finished())).await.unwrap();
        assert_eq!(first.next().await, Some(ChatEvent::finished("r1", "")));
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_content_with_warning() {
        let h = harness(false);
        h.provider.push_stream(MockStream::Events(vec![
            Ok(DecodedEvent::token("Par")),
            Err(ProviderError::Network("reset".to_string())),
        ]));

        let events: Vec<ChatEvent> = h.relay.run_session(request("c1", "r1", "Hello")).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            ChatEvent::finished("r1", "\n\n**⚠️ An error occurred.**")
        );
        let chat = h.store.get("c1").await.unwrap().unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[1].content, "Par\n\n**⚠️ An error occurred.**");
    }

    #[tokio::test]
    async fn upstream_eof_without_terminal_line_completes() {
        let h = harness(false);
        h.provider
            .push_stream(MockStream::Events(vec![Ok(DecodedEvent::token("Hi"))]));

        let events: Vec<ChatEvent> = h.relay.run_session(request("c1", "r1", "Hello")).collect().await;

        assert_eq!(events.last(), Some(&ChatEvent::finished("r1", "")));
        let chat = h.store.get("c1").await.unwrap().unwrap();
        assert_eq!(chat.messages[1].content, "Hi");
    }

    #[tokio::test]
    async fn first_completion_derives_title_once() {
        let h = harness(true);
        h.provider.push_stream(MockStream::tokens(&["Hi there"]));

        let _: Vec<ChatEvent> = h.relay.run_session(request("c1", "r1", "Hello")).collect().await;

        let store = h.store.clone();
        eventually(|| {
            let store = store.clone();
            async move { store.get("c1").await.unwrap().unwrap().title != SENTINEL_TITLE }
        })
        .await;
        assert_eq!(
            h.store.get("c1").await.unwrap().unwrap().title,
            "Mock conversation title"
        );
        assert_eq!(h.provider.complete_calls(), 1);

        let title_request = h.provider.requests().pop().unwrap();
        assert_eq!(title_request.params.max_tokens, Some(20));
        let UpstreamContent::Text(prompt) = &title_request.messages[1].content else {
            panic!("title prompt should be plain text");
        };
        assert!(prompt.ends_with("User: Hello\nAssistant: Hi there"));
    }

    #[tokio::test]
    async fn later_turns_do_not_derive_titles() {
        let h = harness(true);
        let mut req = request("c1", "r2", "And then?");
        req.messages.insert(0, Message::assistant("Earlier answer", None));
        req.messages.insert(0, Message::user("r1", "Hello"));

        let _: Vec<ChatEvent> = h.relay.run_session(req).collect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.provider.complete_calls(), 0);
    }

    #[tokio::test]
    async fn generate_title_refuses_renamed_chat() {
        let h = harness(false);
        h.store.get_or_create("c1", USER).await.unwrap();
        h.store.rename("c1", USER, "Trip planning").await.unwrap();

        let outcome = h
            .relay
            .generate_title("c1", "fast", &[Message::user("m1", "Hello")])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            GenerateTitleResponse {
                title: "Trip planning".to_string(),
                generated: false
            }
        );
        assert_eq!(h.provider.complete_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_title_requests_call_upstream_once() {
        let h = harness(false);
        h.store.get_or_create("c1", USER).await.unwrap();
        let messages = [Message::user("m1", "Hello")];

        let (a, b) = tokio::join!(
            h.relay.generate_title("c1", "fast", &messages),
            h.relay.generate_title("c1", "fast", &messages)
        );

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.title, b.title);
        assert!(a.generated ^ b.generated);
        assert_eq!(h.provider.complete_calls(), 1);
    }

    #[tokio::test]
    async fn generate_title_for_unknown_chat_is_not_found() {
        let h = harness(false);
        let err = h.relay.generate_title("nope", "fast", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn title_failure_leaves_sentinel() {
        let h = harness(false);
        h.store.get_or_create("c1", USER).await.unwrap();
        h.provider.set_completion(Err(ProviderError::Status {
            status: 503,
            body: String::new(),
        }));

        let err = h.relay.generate_title("c1", "fast", &[]).await.unwrap_err();

        assert!(matches!(err, AppError::BadGateway(ref m) if m == "Service unavailable."));
        assert_eq!(h.store.get("c1").await.unwrap().unwrap().title, SENTINEL_TITLE);
    }

    #[tokio::test]
    async fn failed_title_is_not_attempted_again() {
        let h = harness(false);
        h.store.get_or_create("c1", USER).await.unwrap();
        h.provider.set_completion(Err(ProviderError::Timeout));

        assert!(h.relay.generate_title("c1", "fast", &[]).await.is_err());
        h.provider.set_completion(Ok("Late title".to_string()));
        let second = h.relay.generate_title("c1", "fast", &[]).await.unwrap();

        assert_eq!(
            second,
            GenerateTitleResponse {
                title: SENTINEL_TITLE.to_string(),
                generated: false
            }
        );
        assert_eq!(h.provider.complete_calls(), 1);
    }

    #[tokio::test]
    async fn many_concurrent_title_requests_share_one_attempt() {
        let h = harness(false);
        h.store.get_or_create("c1", USER).await.unwrap();
        let messages = [Message::user("m1", "Hello")];

        let results = futures::future::join_all(
            (0..8).map(|_| h.relay.generate_title("c1", "fast", &messages)),
        )
        .await;

        let generated = results
            .into_iter()
            .map(Result::unwrap)
            .filter(|r| r.generated)
            .count();
        assert_eq!(generated, 1);
        assert_eq!(h.provider.complete_calls(), 1);
    }

    #[tokio::test]
    async fn forgotten_chat_can_be_titled_again() {
        let h = harness(false);
        h.store.get_or_create("c1", USER).await.unwrap();
        h.provider.set_completion(Err(ProviderError::Timeout));
        assert!(h.relay.generate_title("c1", "fast", &[]).await.is_err());

        h.relay.forget_chat("c1");
        h.provider.set_completion(Ok("Fresh start".to_string()));
        let outcome = h.relay.generate_title("c1", "fast", &[]).await.unwrap();

        assert!(outcome.generated);
        assert_eq!(outcome.title, "Fresh start");
    }

    #[tokio::test]
    async fn upstream_payload_carries_instructions_and_attachments() {
        let h = harness(false);
        let mut req = request("c1", "r1", "What is this?");
        req.custom_instructions = "Answer in French.".to_string();
        req.messages[0].attachments.push(Attachment {
            file_name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            data: "iVBOR".to_string(),
        });

        let _: Vec<ChatEvent> = h.relay.run_session(req).collect().await;

        let sent = h.provider.requests().remove(0);
        assert_eq!(
            sent.messages[0],
            UpstreamMessage::system("Be helpful.\n\nAnswer in French.")
        );
        let UpstreamContent::Parts(parts) = &sent.messages[1].content else {
            panic!("user turn should be multipart");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,iVBOR"));
    }

    #[tokio::test]
    async fn foreign_chat_is_rejected() {
        let h = harness(false);
        h.store.get_or_create("c1", "someone-else").await.unwrap();

        let events: Vec<ChatEvent> = h.relay.run_session(request("c1", "r1", "Hello")).collect().await;

        assert_eq!(events, vec![ChatEvent::error("r1", "Chat not found.")]);
        assert_eq!(h.provider.stream_calls(), 0);
    }
}

//! Common test utilities for chat-service integration tests.
//!
//! Spawns the real application on a random port with the in-memory store and
//! points it at a fake OpenAI-compatible upstream served by axum.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chat_service::config::{
    ChatConfig, ChatSettings, ModelConfig, ObservabilityConfig, StoreConfig,
    DEFAULT_SYSTEM_PROMPT,
};
use chat_service::startup::{AppState, Application};
use futures::{Stream, StreamExt};
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::config::Config as CommonConfig;
use service_core::protocol::ChatEvent;
use service_core::utils::LineBuffer;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::net::TcpListener;

pub const TEST_USER: &str = "user-1";
pub const TEST_MODEL: &str = "test-model";

/// Prompts the fake upstream reacts to.
pub const PROMPT_RATE_LIMIT: &str = "please rate limit me";
pub const PROMPT_STALL: &str = "stall after two tokens";
pub const GENERATED_TITLE: &str = "Friendly greeting exchange";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,chat_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Clone, Default)]
pub struct FakeUpstream {
    pub stream_requests: Arc<AtomicUsize>,
    pub title_requests: Arc<AtomicUsize>,
    pub bodies: Arc<Mutex<Vec<Value>>>,
}

fn sse_chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": content}}]})
    )
}

fn last_user_text(body: &Value) -> String {
    body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"][0]["text"].as_str())
        .unwrap_or_default()
        .to_string()
}

async fn completions(State(upstream): State<FakeUpstream>, Json(body): Json<Value>) -> Response {
    upstream.bodies.lock().unwrap().push(body.clone());

    if body["stream"] != json!(true) {
        upstream.title_requests.fetch_add(1, Ordering::SeqCst);
        return Json(json!({
            "choices": [{"message": {"role": "assistant", "content": format!("\"{}\"", GENERATED_TITLE)}}]
        }))
        .into_response();
    }

    upstream.stream_requests.fetch_add(1, Ordering::SeqCst);
    let prompt = last_user_text(&body);

    if prompt == PROMPT_RATE_LIMIT {
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, std::io::Error>> + Send>>;
    let chunks: ChunkStream = if prompt == PROMPT_STALL {
        let head = vec![Ok(sse_chunk("Hel")), Ok(sse_chunk("lo "))];
        Box::pin(futures::stream::iter(head).chain(futures::stream::pending()))
    } else {
        // Split mid-line to exercise line reassembly.
        let mut full = String::new();
        for token in ["Hi", " there", "!"] {
            full.push_str(&sse_chunk(token));
        }
        full.push_str("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
        full.push_str("data: [DONE]\n\n");
        let pieces: Vec<Result<String, std::io::Error>> = full
            .as_bytes()
            .chunks(17)
            .map(|c| Ok(String::from_utf8_lossy(c).into_owned()))
            .collect();
        Box::pin(futures::stream::iter(pieces))
    };

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(chunks))
        .unwrap()
}

async fn spawn_upstream() -> (String, FakeUpstream) {
    let upstream = FakeUpstream::default();
    let router = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(upstream.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    (format!("http://127.0.0.1:{}/v1", port), upstream)
}

pub struct TestApp {
    pub address: String,
    pub state: AppState,
    pub upstream: FakeUpstream,
    pub client: reqwest::Client,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(false).await
}

pub async fn spawn_app_with(auto_title: bool) -> TestApp {
    init_tracing();

    let (api_url, upstream) = spawn_upstream().await;

    let config = ChatConfig {
        common: CommonConfig { port: 0 },
        store: StoreConfig::Memory,
        models: vec![ModelConfig {
            id: TEST_MODEL.to_string(),
            model: "fake-gpt".to_string(),
            provider: "openai".to_string(),
            api_url,
            api_key: Secret::new("sk-test".to_string()),
        }],
        chat: ChatSettings {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            auto_title,
            upstream_timeout_secs: 5,
        },
        observability: ObservabilityConfig {
            log_level: "debug".to_string(),
            otlp_endpoint: None,
        },
    };

    let app = Application::build(config)
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());
    let state = app.state().clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    TestApp {
        address,
        state,
        upstream,
        client: reqwest::Client::new(),
    }
}

pub fn chat_body(chat_id: &str, request_id: &str, prompt: &str) -> Value {
    json!({
        "chatId": chat_id,
        "requestId": request_id,
        "model": {"id": TEST_MODEL},
        "messages": [{"id": request_id, "role": "user", "content": prompt, "attachments": []}]
    })
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn post_chat(&self, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url("/api/chat"))
            .header("X-User-ID", TEST_USER)
            .json(body)
            .send()
            .await
            .expect("Failed to send chat request")
    }

    /// Send a chat request and collect its whole event stream.
    pub async fn chat(&self, body: &Value) -> Vec<ChatEvent> {
        let mut reader = EventReader::new(self.post_chat(body).await);
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await {
            events.push(event);
        }
        events
    }

    pub async fn get_json(&self, path: &str) -> Value {
        self.client
            .get(self.url(path))
            .header("X-User-ID", TEST_USER)
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Failed to parse JSON")
    }

    pub async fn chats(&self) -> Vec<Value> {
        self.get_json("/api/chats")
            .await
            .as_array()
            .cloned()
            .unwrap_or_default()
    }

    /// Poll `check` until it holds or two seconds pass.
    pub async fn eventually<F, Fut>(&self, mut check: F)
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
}

/// Incremental reader for a `text/event-stream` response.
pub struct EventReader {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<axum::body::Bytes>> + Send>>,
    lines: LineBuffer,
    pending: VecDeque<ChatEvent>,
}

impl EventReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            body: Box::pin(response.bytes_stream()),
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
        }
    }

    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .expect("Timed out waiting for event")?
                .expect("Stream failed");
            for line in self.lines.push(&chunk) {
                if let Some(data) = line.strip_prefix("data:") {
                    self.pending
                        .push_back(serde_json::from_str(data.trim()).expect("Bad event JSON"));
                }
            }
        }
    }
}

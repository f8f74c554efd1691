//! Common test utilities for chat-client integration tests.
//!
//! Runs the real relay server on a random port with the in-memory chat store
//! and a scripted provider, and points a tracker with an in-memory replica at
//! it.

#![allow(dead_code)]

use chat_client::{RelayClient, Replica, Tracker};
use chat_service::config::{
    ChatConfig, ChatSettings, ModelConfig, ObservabilityConfig, StoreConfig,
    DEFAULT_SYSTEM_PROMPT,
};
use chat_service::services::providers::mock::MockChatProvider;
use chat_service::startup::{AppState, Application};
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use service_core::protocol::ModelSelection;
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

pub const TEST_USER: &str = "user-1";
pub const TEST_MODEL: &str = "test-model";

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,chat_client=debug,chat_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestClient {
    pub address: String,
    pub server: AppState,
    pub provider: Arc<MockChatProvider>,
    pub tracker: Tracker,
}

pub fn model() -> ModelSelection {
    ModelSelection {
        id: TEST_MODEL.to_string(),
        custom_instructions: String::new(),
    }
}

pub async fn spawn_server(provider: Arc<MockChatProvider>) -> (String, AppState) {
    let config = ChatConfig {
        common: CommonConfig { port: 0 },
        store: StoreConfig::Memory,
        models: vec![ModelConfig {
            id: TEST_MODEL.to_string(),
            model: "mock-gpt".to_string(),
            provider: "openai".to_string(),
            api_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: Secret::new("sk-test".to_string()),
        }],
        chat: ChatSettings {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            // Titles are left to the client.
            auto_title: false,
            upstream_timeout_secs: 5,
        },
        observability: ObservabilityConfig {
            log_level: "debug".to_string(),
            otlp_endpoint: None,
        },
    };

    let app = Application::build_with_provider(config, provider)
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());
    let state = app.state().clone();

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    (address, state)
}

pub async fn spawn_client() -> TestClient {
    init_tracing();

    let provider = Arc::new(MockChatProvider::new());
    let (address, server) = spawn_server(provider.clone()).await;

    let api = RelayClient::new(&address, TEST_USER).expect("Failed to build client");
    let replica = Replica::in_memory().await.expect("Failed to open replica");
    let tracker = Tracker::new(api, replica)
        .await
        .expect("Failed to create tracker");

    TestClient {
        address,
        server,
        provider,
        tracker,
    }
}

impl TestClient {
    /// A second tracker against the same server with its own empty replica.
    pub async fn fresh_tracker(&self) -> Tracker {
        let api = RelayClient::new(&self.address, TEST_USER).expect("Failed to build client");
        let replica = Replica::in_memory().await.expect("Failed to open replica");
        Tracker::new(api, replica)
            .await
            .expect("Failed to create tracker")
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

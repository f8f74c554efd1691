//! Application startup and lifecycle management.

use crate::config::{ChatConfig, StoreConfig};
use crate::handlers::{chat, chats, health};
use crate::services::metrics;
use crate::services::providers::openai::OpenAiCompatibleProvider;
use crate::services::providers::ChatProvider;
use crate::services::{
    ChatStore, ConfigCredentialStore, CredentialStore, MemoryChatStore, MongoChatStore,
    RelayService, RelaySettings,
};
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayService,
    pub store: Arc<dyn ChatStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let provider = OpenAiCompatibleProvider::new(Duration::from_secs(
            config.chat.upstream_timeout_secs,
        ))
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        Self::build_with_provider(config, Arc::new(provider)).await
    }

    /// Build with an explicit upstream provider.
    pub async fn build_with_provider(
        config: ChatConfig,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, AppError> {
        metrics::init_metrics().map_err(|e| {
            tracing::error!("Failed to initialize metrics: {}", e);
            AppError::InternalError(anyhow::anyhow!(e))
        })?;

        let store: Arc<dyn ChatStore> = match &config.store {
            StoreConfig::Mongo(mongo) => {
                let store = MongoChatStore::connect(&mongo.uri, &mongo.database)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to MongoDB: {}", e);
                        e
                    })?;
                store.initialize_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    e
                })?;
                Arc::new(store)
            }
            StoreConfig::Memory => {
                tracing::warn!("Using in-memory chat store; chats are lost on restart");
                Arc::new(MemoryChatStore::new())
            }
        };

        let credentials: Arc<dyn CredentialStore> =
            Arc::new(ConfigCredentialStore::new(&config.models));
        tracing::info!(models = config.models.len(), "Initialized credential store");

        let relay = RelayService::new(
            store.clone(),
            credentials.clone(),
            provider,
            RelaySettings {
                system_prompt: config.chat.system_prompt.clone(),
                auto_title: config.chat.auto_title,
            },
        );

        let state = AppState {
            relay,
            store,
            credentials,
        };

        // Port 0 binds a random port for testing
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Chat service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, router(self.state)).await
    }

    /// Run until `signal` resolves, then drain in-flight requests.
    pub async fn run_with_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat", post(chat::post_chat).delete(chat::delete_chat))
        .route("/chat/generate-title", post(chat::generate_title))
        .route("/chat/:chat_id/stop", post(chat::stop_chat))
        .route("/chat/:chat_id/title", patch(chat::rename_chat))
        .route("/chats", get(chats::list_chats).delete(chats::delete_chats))
        .route("/models", get(chats::list_models))
        .route("/sync", get(chats::sync));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

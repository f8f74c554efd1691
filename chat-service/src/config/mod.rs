use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_optional_env, is_production};
use service_core::error::AppError;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant responding in markdown with code blocks, lists, links (from web search), and clear formatting. Make sure to response in same language as user input.";

const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub store: StoreConfig,
    pub models: Vec<ModelConfig>,
    pub chat: ChatSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    Mongo(MongoConfig),
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

/// One upstream model the relay may talk to.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub api_url: String,
    pub api_key: Secret<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    pub system_prompt: String,
    /// Derive a title server-side after a new chat's first completion.
    pub auto_title: bool,
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<ModelConfig>,
}

impl ChatConfig {
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = is_production();

        let store = match get_env("CHAT_STORE", Some("mongodb"), is_prod)?.as_str() {
            "memory" => StoreConfig::Memory,
            "mongodb" => StoreConfig::Mongo(MongoConfig {
                uri: get_env("MONGODB_URI", Some("mongodb://localhost:27017"), is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("chat_db"), is_prod)?,
            }),
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "CHAT_STORE must be 'mongodb' or 'memory', got '{}'",
                    other
                )))
            }
        };

        Ok(ChatConfig {
            common,
            store,
            models: load_models()?,
            chat: ChatSettings {
                system_prompt: get_optional_env("CHAT_SYSTEM_PROMPT")
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
                auto_title: parse_bool(
                    &get_optional_env("CHAT_AUTO_TITLE").unwrap_or_else(|| "true".to_string()),
                )?,
                upstream_timeout_secs: get_optional_env("UPSTREAM_TIMEOUT_SECS")
                    .map(|v| {
                        v.parse().map_err(|_| {
                            AppError::ConfigError(anyhow::anyhow!(
                                "UPSTREAM_TIMEOUT_SECS must be a number of seconds"
                            ))
                        })
                    })
                    .transpose()?
                    .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            },
            observability: ObservabilityConfig {
                log_level: get_optional_env("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            },
        })
    }
}

/// Models come from `CHAT_MODELS_FILE` when set, otherwise from a single
/// `UPSTREAM_*` definition. Having none is allowed; every session then fails
/// with "Model not found."
fn load_models() -> Result<Vec<ModelConfig>, AppError> {
    if let Some(path) = get_optional_env("CHAT_MODELS_FILE") {
        let file: ModelsFile = config::Config::builder()
            .add_source(config::File::with_name(&path))
            .build()?
            .try_deserialize()?;
        tracing::info!(path = %path, count = file.models.len(), "Loaded model definitions");
        return Ok(file.models);
    }

    let Some(api_url) = get_optional_env("UPSTREAM_API_URL") else {
        tracing::warn!("No upstream models configured");
        return Ok(Vec::new());
    };

    let model = get_optional_env("UPSTREAM_MODEL").ok_or_else(|| {
        AppError::ConfigError(anyhow::anyhow!(
            "UPSTREAM_MODEL is required when UPSTREAM_API_URL is set"
        ))
    })?;

    Ok(vec![ModelConfig {
        id: get_optional_env("UPSTREAM_MODEL_ID").unwrap_or_else(|| model.clone()),
        provider: get_optional_env("UPSTREAM_PROVIDER").unwrap_or_else(|| "openai".to_string()),
        api_key: Secret::new(get_optional_env("UPSTREAM_API_KEY").unwrap_or_default()),
        api_url,
        model,
    }])
}

fn parse_bool(value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(AppError::ConfigError(anyhow::anyhow!(
            "expected a boolean, got '{}'",
            other
        ))),
    }
}

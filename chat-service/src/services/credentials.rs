//! Model credential lookup.

use crate::config::ModelConfig;
use async_trait::async_trait;
use secrecy::Secret;
use service_core::error::AppError;
use service_core::protocol::ModelInfo;

/// A resolved model with its usable (already decrypted) API key.
#[derive(Debug, Clone)]
pub struct ModelCredentials {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub api_url: String,
    pub api_key: Secret<String>,
}

impl ModelCredentials {
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            id: self.id.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
        }
    }
}

/// Where model definitions and their keys live. Decrypting stored keys is
/// the implementation's job.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_model(&self, model_id: &str) -> Result<Option<ModelCredentials>, AppError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AppError>;
}

/// Credentials taken from service configuration.
pub struct ConfigCredentialStore {
    models: Vec<ModelCredentials>,
}

impl ConfigCredentialStore {
    pub fn new(models: &[ModelConfig]) -> Self {
        Self {
            models: models
                .iter()
                .map(|m| ModelCredentials {
                    id: m.id.clone(),
                    model: m.model.clone(),
                    provider: m.provider.clone(),
                    api_url: m.api_url.clone(),
                    api_key: m.api_key.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialStore for ConfigCredentialStore {
    async fn get_model(&self, model_id: &str) -> Result<Option<ModelCredentials>, AppError> {
        Ok(self.models.iter().find(|m| m.id == model_id).cloned())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AppError> {
        Ok(self.models.iter().map(ModelCredentials::info).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn store() -> ConfigCredentialStore {
        ConfigCredentialStore::new(&[ModelConfig {
            id: "fast".to_string(),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: Secret::new("sk-test".to_string()),
        }])
    }

    #[tokio::test]
    async fn resolves_known_model_with_key() {
        let model = store().get_model("fast").await.unwrap().unwrap();
        assert_eq!(model.model, "gpt-4o-mini");
        assert_eq!(model.api_key.expose_secret(), "sk-test");
    }

    #[tokio::test]
    async fn unknown_model_is_none() {
        assert!(store().get_model("slow").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_omits_credentials() {
        let models = store().list_models().await.unwrap();
        assert_eq!(
            models,
            vec![ModelInfo {
                id: "fast".to_string(),
                model: "gpt-4o-mini".to_string(),
                provider: "openai".to_string(),
            }]
        );
    }
}

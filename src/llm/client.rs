//! LLM Client abstractions and provider management
//!
//! The orchestration core never talks to a model directly; the decision service
//! and the report synthesizer do, through this trait:
//! - **OpenAI**: any OpenAI-compatible `/chat/completions` endpoint (`openai` feature)
//! - **Ollama**: local inference through an Ollama server (`ollama` feature)

use crate::types::{AppError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Generic LLM client trait for provider abstraction
///
/// All LLM providers implement this trait, allowing for easy swapping
/// between providers without changing application code.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Generate a completion from a prompt
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generate with system prompt
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    /// Get the model name/identifier
    fn model_name(&self) -> &str;
}

/// Sampling and transport parameters shared by every provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Provider enum for runtime selection
///
/// | Provider | Endpoint | Notes |
/// |----------|----------|-------|
/// | OpenAI | `{api_base}/chat/completions` | Also OpenRouter, vLLM, LM Studio |
/// | Ollama | `{base_url}/api/chat` | Recommended for local runs |
#[derive(Debug, Clone)]
pub enum Provider {
    /// OpenAI API provider (including compatible APIs)
    ///
    /// # Example
    /// ```rust,ignore
    /// let provider = Provider::OpenAI {
    ///     api_key: "sk-...".to_string(),
    ///     api_base: "https://api.openai.com/v1".to_string(),
    ///     model: "gpt-4o-mini".to_string(),
    ///     params: ModelParams::default(),
    /// };
    /// ```
    OpenAI {
        api_key: String,
        api_base: String,
        model: String,
        params: ModelParams,
    },

    /// Ollama local LLM provider
    Ollama {
        base_url: String,
        model: String,
        params: ModelParams,
    },
}

impl Provider {
    /// Create a client instance for this provider
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built or the
    /// provider configuration is incomplete.
    pub fn create_client(&self) -> Result<Box<dyn LLMClient>> {
        match self {
            #[cfg(feature = "openai")]
            Provider::OpenAI {
                api_key,
                api_base,
                model,
                params,
            } => {
                if api_key.is_empty() {
                    return Err(AppError::Configuration(format!(
                        "OpenAI provider for model '{}' has an empty API key",
                        model
                    )));
                }
                Ok(Box::new(super::openai::OpenAIClient::new(
                    api_key.clone(),
                    api_base.clone(),
                    model.clone(),
                    params.clone(),
                )?))
            }

            #[cfg(feature = "ollama")]
            Provider::Ollama {
                base_url,
                model,
                params,
            } => Ok(Box::new(super::ollama::OllamaClient::new(
                base_url.clone(),
                model.clone(),
                params.clone(),
            )?)),

            #[allow(unreachable_patterns)]
            other => Err(AppError::Configuration(format!(
                "{} support not compiled in; rebuild with the '{}' feature",
                other.name(),
                other.name().to_lowercase()
            ))),
        }
    }

    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAI { .. } => "OpenAI",
            Provider::Ollama { .. } => "Ollama",
        }
    }

    /// The model this provider is configured for
    pub fn model(&self) -> &str {
        match self {
            Provider::OpenAI { model, .. } | Provider::Ollama { model, .. } => model,
        }
    }
}

/// Configuration-based client factory
///
/// ```rust,ignore
/// use argus::llm::{LLMClientFactory, Provider};
///
/// let factory = LLMClientFactory::new(Provider::Ollama {
///     base_url: "http://localhost:11434".to_string(),
///     model: "llama3.2".to_string(),
///     params: ModelParams::default(),
/// });
///
/// let client = factory.create_default()?;
/// ```
pub struct LLMClientFactory {
    default_provider: Provider,
}

impl LLMClientFactory {
    /// Create a new factory with the specified default provider
    pub fn new(default_provider: Provider) -> Self {
        Self { default_provider }
    }

    /// Create a client using the default provider
    pub fn create_default(&self) -> Result<Box<dyn LLMClient>> {
        self.default_provider.create_client()
    }

    /// Get a reference to the default provider
    pub fn default_provider(&self) -> &Provider {
        &self.default_provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name() {
        let openai = Provider::OpenAI {
            api_key: "".to_string(),
            api_base: "".to_string(),
            model: "gpt-4o-mini".to_string(),
            params: ModelParams::default(),
        };
        assert_eq!(openai.name(), "OpenAI");
        assert_eq!(openai.model(), "gpt-4o-mini");

        let ollama = Provider::Ollama {
            base_url: "".to_string(),
            model: "llama3.2".to_string(),
            params: ModelParams::default(),
        };
        assert_eq!(ollama.name(), "Ollama");
    }

    #[cfg(feature = "openai")]
    #[test]
    fn test_openai_requires_api_key() {
        let provider = Provider::OpenAI {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            params: ModelParams::default(),
        };

        // Box<dyn LLMClient> doesn't implement Debug, so match instead of unwrap_err
        let err = match provider.create_client() {
            Ok(_) => panic!("Expected error"),
            Err(e) => e.to_string(),
        };
        assert!(err.contains("empty API key"));
    }

    #[cfg(feature = "ollama")]
    #[test]
    fn test_factory_default_provider() {
        let factory = LLMClientFactory::new(Provider::Ollama {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            params: ModelParams::default(),
        });
        assert_eq!(factory.default_provider().name(), "Ollama");
        assert!(factory.create_default().is_ok());
    }
}

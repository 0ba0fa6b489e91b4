use crate::llm::client::{LLMClient, ModelParams};
use crate::types::{AppError, Result};
use async_trait::async_trait;
use ollama_rs::{
    Ollama,
    generation::chat::{ChatMessage, request::ChatMessageRequest},
    generation::parameters::FormatType,
    models::ModelOptions,
};

/// Client for a local Ollama server.
pub struct OllamaClient {
    client: Ollama,
    model: String,
    params: ModelParams,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String, params: ModelParams) -> Result<Self> {
        let url = reqwest::Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            AppError::Configuration(format!("Invalid Ollama base URL '{}': {}", base_url, e))
        })?;

        Ok(Self {
            client: Ollama::from_url(url),
            model,
            params,
        })
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String> {
        // Decision prompts all ask for a JSON object
        let request = ChatMessageRequest::new(self.model.clone(), messages)
            .format(FormatType::Json)
            .options(
                ModelOptions::default()
                    .temperature(self.params.temperature)
                    .num_predict(self.params.max_tokens as i32),
            );

        let response = tokio::time::timeout(
            self.params.request_timeout,
            self.client.send_chat_messages(request),
        )
        .await
        .map_err(|_| {
            AppError::LLM(format!(
                "Ollama request timed out after {:?}",
                self.params.request_timeout
            ))
        })?
        .map_err(|e| AppError::LLM(format!("Ollama error: {}", e)))?;

        Ok(response.message.content)
    }
}

#[async_trait]
impl LLMClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.chat(vec![ChatMessage::user(prompt.to_string())]).await
    }

    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        self.chat(vec![
            ChatMessage::system(system.to_string()),
            ChatMessage::user(prompt.to_string()),
        ])
        .await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(content: &str) -> serde_json::Value {
        json!({
            "model": "llama3.2",
            "created_at": "2025-01-01T00:00:00Z",
            "message": {"role": "assistant", "content": content},
            "done": true
        })
    }

    #[tokio::test]
    async fn test_generate_reads_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "llama3.2", "format": "json"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("{\"tasks\":[]}")))
            .mount(&server)
            .await;

        let client =
            OllamaClient::new(server.uri(), "llama3.2".to_string(), ModelParams::default())
                .unwrap();
        let out = client.generate("decompose").await.unwrap();
        assert_eq!(out, "{\"tasks\":[]}");
    }

    #[tokio::test]
    async fn test_missing_content_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"done": true})))
            .mount(&server)
            .await;

        let client =
            OllamaClient::new(server.uri(), "llama3.2".to_string(), ModelParams::default())
                .unwrap();
        assert!(client.generate("x").await.is_err());
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(reply("late"))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let params = ModelParams {
            request_timeout: Duration::from_millis(100),
            ..ModelParams::default()
        };
        let client = OllamaClient::new(server.uri(), "llama3.2".to_string(), params).unwrap();
        let err = client.generate("x").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_invalid_base_url_is_configuration_error() {
        let err = match OllamaClient::new(
            "not a url".to_string(),
            "llama3.2".to_string(),
            ModelParams::default(),
        ) {
            Ok(_) => panic!("Expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, AppError::Configuration(_)));
    }
}

use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::AppError,
    utils::{
        backoff::CallPolicy,
        config::{AppConfig, GenerationBackend},
    },
};

/// A single prompt-to-text request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 500,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Prompt to natural-language text capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError>;
}

#[derive(Clone)]
pub struct GenerationProvider {
    inner: GenerationInner,
    policy: CallPolicy,
}

#[derive(Clone)]
enum GenerationInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
    },
    Ollama {
        http: reqwest::Client,
        host: String,
        model: String,
    },
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

impl GenerationProvider {
    /// Select the backend once, at startup.
    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let policy = CallPolicy::from_config(config);
        let provider = match config.generation_backend {
            GenerationBackend::OpenAI => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Configuration(
                        "OpenAI generation backend selected without an OpenAI client".into(),
                    )
                })?;
                Self::new_openai(client, config.chat_model.clone(), policy)
            }
            GenerationBackend::Ollama => {
                Self::new_ollama(config.ollama_host.clone(), config.ollama_model.clone(), policy)?
            }
        };

        info!(
            backend = provider.backend_label(),
            model = provider.model_name(),
            "Generation provider initialized"
        );
        Ok(provider)
    }

    pub fn new_openai(client: Arc<Client<OpenAIConfig>>, model: String, policy: CallPolicy) -> Self {
        Self {
            inner: GenerationInner::OpenAI { client, model },
            policy,
        }
    }

    pub fn new_ollama(host: String, model: String, policy: CallPolicy) -> Result<Self, AppError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            inner: GenerationInner::Ollama {
                http,
                host: host.trim_end_matches('/').to_string(),
                model,
            },
            policy,
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            GenerationInner::OpenAI { .. } => "openai",
            GenerationInner::Ollama { .. } => "ollama",
        }
    }

    async fn generate_openai(
        client: &Client<OpenAIConfig>,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<String, AppError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(ChatCompletionRequestSystemMessage::from(system_prompt.as_str()).into());
        }
        messages.push(ChatCompletionRequestUserMessage::from(request.prompt.as_str()).into());

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .temperature(request.temperature)
            .max_completion_tokens(request.max_tokens)
            .messages(messages)
            .build()?;

        let response = client.chat().create(chat_request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))
    }

    async fn generate_ollama(
        http: &reqwest::Client,
        host: &str,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<String, AppError> {
        // /api/generate has no system slot; the system prompt is prefixed.
        let prompt = match &request.system_prompt {
            Some(system_prompt) => format!("{system_prompt}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };

        let body = OllamaGenerateRequest {
            model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = http
            .post(format!("{host}/api/generate"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Backend {
                service: "ollama",
                status: Some(status.as_u16()),
                message,
            });
        }

        let parsed: OllamaGenerateResponse = response.json().await?;
        Ok(parsed.response.trim().to_string())
    }
}

#[async_trait]
impl TextGenerator for GenerationProvider {
    fn model_name(&self) -> &str {
        match &self.inner {
            GenerationInner::OpenAI { model, .. } | GenerationInner::Ollama { model, .. } => model,
        }
    }

    #[instrument(level = "debug", skip_all, fields(backend = self.backend_label(), max_tokens = request.max_tokens))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError> {
        match &self.inner {
            GenerationInner::OpenAI { client, model } => {
                self.policy
                    .run("openai_generation", || {
                        Self::generate_openai(client, model, request)
                    })
                    .await
            }
            GenerationInner::Ollama { http, host, model } => {
                self.policy
                    .run("ollama_generation", || {
                        Self::generate_ollama(http, host, model, request)
                    })
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_budget() {
        let request = GenerationRequest::new("question")
            .with_system_prompt("be brief")
            .with_temperature(0.2)
            .with_max_tokens(128);

        assert_eq!(request.prompt, "question");
        assert_eq!(request.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(request.max_tokens, 128);
        assert!((request.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn ollama_selected_without_openai_client() {
        let config = AppConfig {
            generation_backend: GenerationBackend::Ollama,
            ollama_host: "http://localhost:11434/".into(),
            ..AppConfig::default()
        };
        let provider = GenerationProvider::from_config(&config, None).expect("ollama provider");
        assert_eq!(provider.backend_label(), "ollama");
        assert_eq!(provider.model_name(), "llama3");
    }

    #[test]
    fn openai_backend_without_client_is_a_configuration_error() {
        let config = AppConfig::default();
        let err = GenerationProvider::from_config(&config, None)
            .err()
            .expect("missing client");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn unreachable_ollama_fails_without_hanging() {
        let policy = CallPolicy {
            timeout: std::time::Duration::from_millis(500),
            max_retries: 0,
        };
        // Port 9 (discard) is closed on test hosts; connection is refused.
        let provider =
            GenerationProvider::new_ollama("http://127.0.0.1:9".into(), "llama3".into(), policy)
                .expect("client");

        let result = provider.generate(&GenerationRequest::new("hello")).await;
        assert!(result.is_err());
    }
}

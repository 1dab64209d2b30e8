//! GitHub Models Provider
//!
//! Chat completions against the GitHub Models inference endpoint. The
//! API speaks the OpenAI chat-completions shape and authenticates with
//! plain GitHub tokens; two tokens can be configured and are rotated
//! round-robin to spread the per-token rate limit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gateway_core::{
    error::{GatewayError, Result},
    message::{Message, Role},
    provider::{
        ChatProvider, Completion, FinishReason, GenerationOptions, ModelInfo, ProviderInfo,
        TokenUsage,
    },
    retry::RetryPolicy,
};

const DEFAULT_ENDPOINT: &str = "https://models.github.ai/inference";

/// GitHub Models configuration (`GITHUB_TOKEN`, optional `GITHUB_TOKEN2`)
#[derive(Clone, Debug)]
pub struct GithubConfig {
    /// Inference endpoint base URL
    pub endpoint: String,

    /// API tokens, rotated per request
    pub tokens: Vec<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            tokens: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl GithubConfig {
    pub fn from_env() -> Self {
        let tokens = ["GITHUB_TOKEN", "GITHUB_TOKEN2"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty())
            .collect();

        Self {
            endpoint: std::env::var("GITHUB_MODELS_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.into()),
            tokens,
            ..Default::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.tokens.is_empty()
    }
}

/// GitHub Models chat provider
pub struct GithubProvider {
    http: reqwest::Client,
    config: GithubConfig,
    retry: RetryPolicy,
    next_token: AtomicUsize,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl GithubProvider {
    pub fn from_config(config: GithubConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            config,
            retry: RetryPolicy::provider(),
            next_token: AtomicUsize::new(0),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(GithubConfig::from_env())
    }

    /// Next token in round-robin order
    fn rotate_token(&self) -> Result<&str> {
        if self.config.tokens.is_empty() {
            return Err(GatewayError::ProviderUnavailable(
                "GITHUB_TOKEN not set".into(),
            ));
        }
        let index = self.next_token.fetch_add(1, Ordering::Relaxed) % self.config.tokens.len();
        Ok(&self.config.tokens[index])
    }

    /// Map gateway messages to the wire format. Tool results are folded
    /// into user turns.
    fn convert_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
        messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User | Role::Tool => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect()
    }

    fn convert_finish(reason: Option<&str>) -> Option<FinishReason> {
        reason.map(|r| match r {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        })
    }

    async fn send_chat(&self, body: &ChatRequest<'_>, token: &str) -> Result<ChatResponse> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.endpoint))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::ProviderTimeout("github".into())
                } else if e.is_connect() {
                    GatewayError::ProviderUnavailable(e.to_string())
                } else {
                    GatewayError::Provider(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                GatewayError::ProviderUnavailable(format!("github {status}: {detail}"))
            } else {
                GatewayError::Provider(format!("github {status}: {detail}"))
            });
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(format!("github response: {e}")))
    }
}

#[async_trait]
impl ChatProvider for GithubProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "github".into(),
            models: self.list_models().await?,
            // Drives the tool loop through the text protocol
            supports_tools: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.config.is_configured())
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let body = ChatRequest {
            model: &options.model,
            messages: Self::convert_messages(messages),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
        };

        // Each attempt picks its own token, so a retry after a
        // rate-limit hiccup goes out on the other token.
        let parsed = self
            .retry
            .run(|| {
                let token = self.rotate_token();
                let body = &body;
                async move { self.send_chat(body, token?).await }
            })
            .await?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Provider("github returned no choices".into()))?;

        Ok(Completion {
            content: choice.message.content,
            model: parsed.model.unwrap_or_else(|| options.model.clone()),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason: Self::convert_finish(choice.finish_reason.as_deref()),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        // No listing endpoint is used; the catalog is fixed.
        Ok(vec![
            ModelInfo {
                id: "openai/gpt-4.1".into(),
                name: "GPT-4.1".into(),
                context_length: Some(128_000),
            },
            ModelInfo {
                id: "openai/gpt-4.1-mini".into(),
                name: "GPT-4.1 Mini".into(),
                context_length: Some(128_000),
            },
            ModelInfo {
                id: "openai/gpt-4.1-nano".into(),
                name: "GPT-4.1 Nano".into(),
                context_length: Some(128_000),
            },
            ModelInfo {
                id: "xai/grok-3".into(),
                name: "Grok-3".into(),
                context_length: Some(8_192),
            },
            ModelInfo {
                id: "xai/grok-3-mini".into(),
                name: "Grok-3 Mini".into(),
                context_length: Some(8_192),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_provider_is_unhealthy() {
        let config = GithubConfig::default();
        assert!(!config.is_configured());
    }

    #[test]
    fn test_tokens_rotate_round_robin() {
        let provider = GithubProvider::from_config(GithubConfig {
            tokens: vec!["tok-a".into(), "tok-b".into()],
            ..Default::default()
        })
        .unwrap();

        assert_eq!(provider.rotate_token().unwrap(), "tok-a");
        assert_eq!(provider.rotate_token().unwrap(), "tok-b");
        assert_eq!(provider.rotate_token().unwrap(), "tok-a");
    }

    #[tokio::test]
    async fn test_complete_without_token_is_unavailable() {
        let provider = GithubProvider::from_config(GithubConfig::default()).unwrap();
        let err = provider
            .complete(&[Message::user("hi")], &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProviderUnavailable(_)));
    }

    #[test]
    fn test_message_conversion_folds_tool_role() {
        let messages = vec![
            Message::system("helpful"),
            Message::tool("Tool 'get_weather' returned: 12C", None),
            Message::assistant("done"),
        ];

        let wire = GithubProvider::convert_messages(&messages);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }
}

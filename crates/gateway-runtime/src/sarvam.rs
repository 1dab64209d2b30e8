//! Sarvam Provider
//!
//! Cloud chat-completions provider over the Sarvam HTTP API. Chat-only:
//! it never drives the tool loop, so the router ranks it behind
//! tool-capable candidates when a turn needs tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
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

const DEFAULT_BASE_URL: &str = "https://api.sarvam.ai/v1";

/// Sarvam provider configuration
#[derive(Clone, Debug)]
pub struct SarvamConfig {
    /// API base URL
    pub base_url: String,

    /// API subscription key (`SARVAM_API_KEY`)
    pub api_key: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for SarvamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

impl SarvamConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SARVAM_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            api_key: std::env::var("SARVAM_API_KEY").ok(),
            ..Default::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }
}

/// Cloud Sarvam chat provider
pub struct SarvamProvider {
    http: reqwest::Client,
    config: SarvamConfig,
    retry: RetryPolicy,
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

impl SarvamProvider {
    pub fn from_config(config: SarvamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            config,
            retry: RetryPolicy::provider(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(SarvamConfig::from_env())
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GatewayError::ProviderUnavailable("SARVAM_API_KEY not set".into()))
    }

    /// Map gateway messages to the wire format. Tool results are folded
    /// into user turns since the API has no tool role.
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

    async fn send_chat(&self, body: &ChatRequest<'_>, key: &str) -> Result<ChatResponse> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("api-subscription-key", key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::ProviderTimeout("sarvam".into())
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
                GatewayError::ProviderUnavailable(format!("sarvam {status}: {detail}"))
            } else {
                GatewayError::Provider(format!("sarvam {status}: {detail}"))
            });
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Provider(format!("sarvam response: {e}")))
    }
}

#[async_trait]
impl ChatProvider for SarvamProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "sarvam".into(),
            models: self.list_models().await?,
            supports_tools: false,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        // Reachability without a key is not health; the provider is
        // usable only when configured.
        Ok(self.config.is_configured())
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let key = self.api_key()?;

        let body = ChatRequest {
            model: &options.model,
            messages: Self::convert_messages(messages),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
        };

        // Transport hiccups are retried here; hard API errors go
        // straight up so the router can fall back.
        let parsed = self.retry.run(|| self.send_chat(&body, key)).await?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Provider("sarvam returned no choices".into()))?;

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
        // The API does not expose a listing endpoint; the catalog is fixed.
        Ok(vec![
            ModelInfo {
                id: "sarvam-m".into(),
                name: "Sarvam-M".into(),
                context_length: None,
            },
            ModelInfo {
                id: "sarvam-2b".into(),
                name: "Sarvam-2B".into(),
                context_length: None,
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_provider_is_unhealthy() {
        let config = SarvamConfig::default();
        assert!(!config.is_configured());
    }

    #[test]
    fn test_message_conversion_folds_tool_role() {
        let messages = vec![
            Message::system("helpful"),
            Message::tool("Tool 'web_search' returned: ...", None),
            Message::assistant("done"),
        ];

        let wire = SarvamProvider::convert_messages(&messages);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
    }

    #[tokio::test]
    async fn test_complete_without_key_is_unavailable() {
        let provider = SarvamProvider::from_config(SarvamConfig::default()).unwrap();
        let err = provider
            .complete(&[Message::user("hi")], &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProviderUnavailable(_)));
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "model": "sarvam-m",
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
        assert_eq!(parsed.usage.as_ref().map(|u| u.total_tokens), Some(12));
    }
}

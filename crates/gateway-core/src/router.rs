//! Router / Fallback Selector
//!
//! Maps a requested model id to an ordered list of provider candidates
//! to try. Pure function of static configuration plus the request:
//! unknown ids fall back to a fixed default chain, so the selector
//! never returns an empty list. Misconfiguration of the default chain
//! itself is a startup error, never a per-request one.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// A configured model the gateway can route to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Public model id (e.g., "ollama-qwen2.5")
    pub id: String,

    /// Provider that serves it (e.g., "ollama", "sarvam")
    pub provider_id: String,

    /// Upstream model name passed to the provider
    pub upstream_model: String,

    /// Sampling temperature tuned for this model
    pub temperature: f32,

    /// Whether this model can drive the tool-calling loop
    pub supports_tools: bool,

    /// Static priority rank (lower tries first)
    pub rank: u8,
}

/// Candidate produced by the router for one request
///
/// Constructed fresh per request; immutable for the request's lifetime.
#[derive(Clone, Debug)]
pub struct ProviderCandidate {
    pub model_id: String,
    pub provider_id: String,
    pub upstream_model: String,
    pub temperature: f32,
    pub supports_tools: bool,
    pub rank: u8,
}

impl From<&ModelEntry> for ProviderCandidate {
    fn from(entry: &ModelEntry) -> Self {
        Self {
            model_id: entry.id.clone(),
            provider_id: entry.provider_id.clone(),
            upstream_model: entry.upstream_model.clone(),
            temperature: entry.temperature,
            supports_tools: entry.supports_tools,
            rank: entry.rank,
        }
    }
}

/// Static routing configuration
#[derive(Clone, Debug)]
pub struct RouterConfig {
    models: Vec<ModelEntry>,
    default_chain: Vec<String>,
}

impl RouterConfig {
    /// Build a validated configuration. The default chain must be
    /// non-empty and reference only known models.
    pub fn new(models: Vec<ModelEntry>, default_chain: Vec<String>) -> Result<Self> {
        if default_chain.is_empty() {
            return Err(GatewayError::Config("default model chain is empty".into()));
        }
        for id in &default_chain {
            if !models.iter().any(|m| &m.id == id) {
                return Err(GatewayError::Config(format!(
                    "default chain references unknown model '{id}'"
                )));
            }
        }
        Ok(Self {
            models,
            default_chain,
        })
    }

    /// The stock catalog: two local Ollama models (tool-capable) and
    /// two Sarvam cloud models (chat-only).
    pub fn standard() -> Self {
        let models = vec![
            ModelEntry {
                id: "ollama-qwen2.5".into(),
                provider_id: "ollama".into(),
                upstream_model: "qwen2.5:7b-instruct-q5_K_M".into(),
                temperature: 0.2,
                supports_tools: true,
                rank: 0,
            },
            ModelEntry {
                id: "ollama-llama3.1".into(),
                provider_id: "ollama".into(),
                upstream_model: "llama3.1:latest".into(),
                temperature: 0.3,
                supports_tools: true,
                rank: 1,
            },
            ModelEntry {
                id: "sarvam-m".into(),
                provider_id: "sarvam".into(),
                upstream_model: "sarvam-m".into(),
                temperature: 0.7,
                supports_tools: false,
                rank: 2,
            },
            ModelEntry {
                id: "sarvam-2b".into(),
                provider_id: "sarvam".into(),
                upstream_model: "sarvam-2b".into(),
                temperature: 0.7,
                supports_tools: false,
                rank: 3,
            },
            ModelEntry {
                id: "github-xai-grok-3-mini".into(),
                provider_id: "github".into(),
                upstream_model: "xai/grok-3-mini".into(),
                temperature: 0.3,
                supports_tools: true,
                rank: 4,
            },
            ModelEntry {
                id: "github-openai-gpt-4.1".into(),
                provider_id: "github".into(),
                upstream_model: "openai/gpt-4.1".into(),
                temperature: 0.3,
                supports_tools: true,
                rank: 5,
            },
            ModelEntry {
                id: "github-openai-gpt-4.1-nano".into(),
                provider_id: "github".into(),
                upstream_model: "openai/gpt-4.1-nano".into(),
                temperature: 0.3,
                supports_tools: true,
                rank: 6,
            },
            ModelEntry {
                id: "github-xai-grok-3".into(),
                provider_id: "github".into(),
                upstream_model: "xai/grok-3".into(),
                temperature: 0.3,
                supports_tools: true,
                rank: 7,
            },
            ModelEntry {
                id: "github-openai-gpt-4.1-mini".into(),
                provider_id: "github".into(),
                upstream_model: "openai/gpt-4.1-mini".into(),
                temperature: 0.3,
                supports_tools: true,
                rank: 8,
            },
        ];
        let chain = vec![
            "ollama-qwen2.5".into(),
            "ollama-llama3.1".into(),
            "sarvam-m".into(),
        ];
        // Static catalog, already consistent with the chain
        Self {
            models,
            default_chain: chain,
        }
    }

    /// Look up a model entry by public id
    pub fn entry(&self, id: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    /// All configured models
    pub fn models(&self) -> &[ModelEntry] {
        &self.models
    }

    /// Resolve the `"auto"` pseudo-model: technical prompts route to
    /// the reasoning-tuned entry, creative prompts to the
    /// conversational one, everything else to the default chain head.
    pub fn resolve_auto(&self, user_text: &str) -> &str {
        const TECHNICAL: &[&str] = &["code", "program", "debug", "algorithm", "technical", "analyze"];
        const CREATIVE: &[&str] = &["story", "creative", "imagine", "poem", "chat"];

        let lower = user_text.to_lowercase();
        if TECHNICAL.iter().any(|k| lower.contains(k)) && self.entry("ollama-qwen2.5").is_some() {
            return "ollama-qwen2.5";
        }
        if CREATIVE.iter().any(|k| lower.contains(k)) && self.entry("ollama-llama3.1").is_some() {
            return "ollama-llama3.1";
        }
        &self.default_chain[0]
    }

    /// Produce the ordered candidate list for a request.
    ///
    /// The requested model (when known) leads; the default chain
    /// follows as fallbacks, ordered by rank with tool-capable entries
    /// preferred when the conversation implies tool need. Never empty.
    pub fn select_candidates(&self, requested_id: &str, wants_tools: bool) -> Vec<ProviderCandidate> {
        let requested = if requested_id == "auto" {
            None
        } else {
            self.entry(requested_id)
        };

        let mut candidates: Vec<ProviderCandidate> = Vec::new();
        if let Some(entry) = requested {
            candidates.push(entry.into());
        }

        let mut fallbacks: Vec<ProviderCandidate> = self
            .default_chain
            .iter()
            .filter_map(|id| self.entry(id))
            .filter(|e| requested.is_none_or(|r| r.id != e.id))
            .map(ProviderCandidate::from)
            .collect();

        if wants_tools {
            fallbacks.sort_by_key(|c| (!c.supports_tools, c.rank));
        } else {
            fallbacks.sort_by_key(|c| c.rank);
        }
        candidates.extend(fallbacks);

        candidates
    }
}

/// Heuristic: does the user text imply that a tool will be needed?
///
/// Keyword categories mirror the gateway's tool suite (music control,
/// weather, search, news, reference lookup).
pub fn implies_tool_need(user_text: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "music", "song", "play", "spotify", "track", "volume", "pause", "skip", "weather",
        "forecast", "temperature", "search", "news", "headline", "wikipedia", "look up",
    ];
    let lower = user_text.to_lowercase();
    KEYWORDS.iter().any(|k| lower.contains(k))
}

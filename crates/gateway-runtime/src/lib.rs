//! # gateway-runtime
//!
//! Concrete providers and tool integrations for the chat gateway.
//!
//! ## Providers
//!
//! - **Ollama** (default): local inference via the Ollama HTTP API
//! - **GitHub Models**: hosted OpenAI/xAI models behind GitHub tokens
//! - **Sarvam**: cloud chat completions (chat-only, no tool loop)
//!
//! ## Tools
//!
//! Weather (Open-Meteo), web search and news (DuckDuckGo), Wikipedia
//! summaries, and Spotify playback control.

#[cfg(feature = "ollama")]
pub mod ollama;

pub mod github;
pub mod sarvam;
pub mod tools;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

pub use github::{GithubConfig, GithubProvider};
pub use sarvam::{SarvamConfig, SarvamProvider};

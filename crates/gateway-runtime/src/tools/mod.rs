//! Tool Integrations
//!
//! External-capability tools registered with the gateway's tool
//! registry. Network failures are narrated as failed results, not
//! turn-level errors.

pub mod search;
pub mod spotify;
pub mod weather;
pub mod wikipedia;

pub use search::{LatestNewsTool, WebSearchTool};
pub use spotify::{
    AddToPlaylistTool, CurrentTrackTool, PauseMusicTool, PlayTrackTool, SearchTracksTool,
    SetVolumeTool, SkipTrackTool, SpotifyClient, SpotifyConfig,
};
pub use weather::WeatherTool;
pub use wikipedia::WikipediaTool;

use std::time::Duration;

use gateway_core::error::{GatewayError, Result};

pub(crate) const USER_AGENT: &str = "chat-gateway/0.1";

/// Shared HTTP client for tool calls
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| GatewayError::Config(format!("http client: {e}")))
}

/// String argument with surrounding whitespace trimmed
pub(crate) fn str_arg<'a>(
    call: &'a gateway_core::ToolCall,
    name: &str,
) -> Option<&'a str> {
    call.arguments
        .get(name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

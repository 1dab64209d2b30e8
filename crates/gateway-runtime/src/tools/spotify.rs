//! Spotify Tools
//!
//! Playback control and track search against the Spotify Web API.
//! Authentication uses the refresh-token grant; the access token is
//! cached until shortly before expiry.
//!
//! Playback tools that surface a track also attach the track ID as
//! structured result data and embed a legacy `[TRACK_ID:...]` tag in
//! the output text for older clients.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use gateway_core::{
    error::Result,
    tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema},
};

use super::{http_client, str_arg};

const API_URL: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Minimum word-overlap score for a search hit to count as a match
const MATCH_THRESHOLD: f64 = 0.3;

/// Spotify credentials (`SPOTIFY_CLIENT_ID`, `SPOTIFY_CLIENT_SECRET`,
/// `SPOTIFY_REFRESH_TOKEN`)
#[derive(Clone, Debug, Default)]
pub struct SpotifyConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

impl SpotifyConfig {
    pub fn from_env() -> Self {
        Self {
            client_id: std::env::var("SPOTIFY_CLIENT_ID").ok(),
            client_secret: std::env::var("SPOTIFY_CLIENT_SECRET").ok(),
            refresh_token: std::env::var("SPOTIFY_REFRESH_TOKEN").ok(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.refresh_token.is_some()
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub popularity: u32,
    pub artists: Vec<Artist>,
    pub album: Album,
    #[serde(default)]
    pub external_urls: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct Artist {
    pub name: String,
}

#[derive(Deserialize)]
pub struct Album {
    pub name: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    tracks: TrackPage,
}

#[derive(Deserialize)]
struct TrackPage {
    items: Vec<Track>,
}

#[derive(Deserialize)]
struct DevicesResponse {
    devices: Vec<Device>,
}

#[derive(Deserialize)]
struct Device {
    id: String,
}

#[derive(Deserialize)]
struct CurrentlyPlaying {
    item: Option<Track>,
}

#[derive(Deserialize)]
struct UserProfile {
    id: String,
}

#[derive(Deserialize)]
struct Playlist {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct PlaylistPage {
    items: Vec<Playlist>,
}

impl Track {
    fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Word-overlap score between the query and a track's name plus artists
fn match_score(query: &str, track: &Track) -> f64 {
    let query_words: std::collections::HashSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();
    if query_words.is_empty() {
        return 0.0;
    }

    let combined = format!("{} {}", track.name, track.artist_names()).to_lowercase();
    let track_words: std::collections::HashSet<&str> = combined.split_whitespace().collect();

    let overlap = query_words
        .iter()
        .filter(|w| track_words.contains(w.as_str()))
        .count();
    overlap as f64 / query_words.len() as f64
}

/// Pick the first hit clearing the overlap threshold, else the first
fn best_match(query: &str, tracks: Vec<Track>) -> Option<Track> {
    let mut iter = tracks.into_iter();
    let first = iter.next()?;

    if match_score(query, &first) > MATCH_THRESHOLD {
        return Some(first);
    }
    for track in iter {
        if match_score(query, &track) > MATCH_THRESHOLD {
            return Some(track);
        }
    }
    Some(first)
}

/// Authenticated Spotify Web API client shared by the playback tools
pub struct SpotifyClient {
    http: reqwest::Client,
    config: SpotifyConfig,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(config: SpotifyConfig) -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_secs(10))?,
            config,
            token: Mutex::new(None),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(SpotifyConfig::from_env())
    }

    async fn access_token(&self) -> std::result::Result<String, String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let (Some(id), Some(secret), Some(refresh)) = (
            self.config.client_id.as_deref(),
            self.config.client_secret.as_deref(),
            self.config.refresh_token.as_deref(),
        ) else {
            return Err("Spotify is not configured. Set SPOTIFY_CLIENT_ID, \
                        SPOTIFY_CLIENT_SECRET and SPOTIFY_REFRESH_TOKEN."
                .into());
        };

        let response: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .basic_auth(id, Some(secret))
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh)])
            .send()
            .await
            .map_err(|e| format!("Spotify auth error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify auth error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify auth error: {e}"))?;

        // Refresh a minute early to avoid expiry mid-call
        let expires_at =
            Instant::now() + Duration::from_secs(response.expires_in.saturating_sub(60));
        let token = response.access_token.clone();
        *cached = Some(CachedToken {
            access_token: response.access_token,
            expires_at,
        });
        Ok(token)
    }

    pub async fn search_tracks(
        &self,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Track>, String> {
        let token = self.access_token().await?;
        let response: SearchResponse = self
            .http
            .get(format!("{API_URL}/search"))
            .bearer_auth(token)
            .query(&[
                ("q", query),
                ("type", "track"),
                ("limit", &limit.min(10).to_string()),
            ])
            .send()
            .await
            .map_err(|e| format!("Spotify search error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify search error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify search error: {e}"))?;

        Ok(response.tracks.items)
    }

    /// First active device, if any
    async fn active_device(&self) -> std::result::Result<Option<String>, String> {
        let token = self.access_token().await?;
        let response: DevicesResponse = self
            .http
            .get(format!("{API_URL}/me/player/devices"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?;

        Ok(response.devices.into_iter().next().map(|d| d.id))
    }

    async fn start_playback(
        &self,
        device_id: &str,
        uri: &str,
    ) -> std::result::Result<(), String> {
        let token = self.access_token().await?;
        self.http
            .put(format!("{API_URL}/me/player/play"))
            .bearer_auth(token)
            .query(&[("device_id", device_id)])
            .json(&serde_json::json!({ "uris": [uri] }))
            .send()
            .await
            .map_err(|e| format!("Spotify playback error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify playback error: {e}"))?;
        Ok(())
    }

    async fn pause(&self) -> std::result::Result<(), String> {
        let token = self.access_token().await?;
        self.http
            .put(format!("{API_URL}/me/player/pause"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?;
        Ok(())
    }

    async fn next_track(&self) -> std::result::Result<(), String> {
        let token = self.access_token().await?;
        self.http
            .post(format!("{API_URL}/me/player/next"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?;
        Ok(())
    }

    async fn currently_playing(&self) -> std::result::Result<Option<Track>, String> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{API_URL}/me/player/currently-playing"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let playing: CurrentlyPlaying = response
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?;
        Ok(playing.item)
    }

    async fn user_id(&self) -> std::result::Result<String, String> {
        let token = self.access_token().await?;
        let profile: UserProfile = self
            .http
            .get(format!("{API_URL}/me"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?;
        Ok(profile.id)
    }

    /// Find a playlist by name (case-insensitive) or create a private
    /// one with that name.
    async fn find_or_create_playlist(&self, name: &str) -> std::result::Result<Playlist, String> {
        let token = self.access_token().await?;
        let page: PlaylistPage = self
            .http
            .get(format!("{API_URL}/me/playlists"))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?;

        if let Some(existing) = page
            .items
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
        {
            return Ok(existing);
        }

        let user = self.user_id().await?;
        let created: Playlist = self
            .http
            .post(format!("{API_URL}/users/{user}/playlists"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "name": name, "public": false }))
            .send()
            .await
            .map_err(|e| format!("Spotify playlist error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify playlist error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Spotify playlist error: {e}"))?;
        Ok(created)
    }

    async fn add_to_playlist(
        &self,
        playlist_id: &str,
        uri: &str,
    ) -> std::result::Result<(), String> {
        let token = self.access_token().await?;
        self.http
            .post(format!("{API_URL}/playlists/{playlist_id}/tracks"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "uris": [uri] }))
            .send()
            .await
            .map_err(|e| format!("Spotify playlist error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify playlist error: {e}"))?;
        Ok(())
    }

    async fn set_volume(&self, percent: u32, device_id: &str) -> std::result::Result<(), String> {
        let token = self.access_token().await?;
        self.http
            .put(format!("{API_URL}/me/player/volume"))
            .bearer_auth(token)
            .query(&[
                ("volume_percent", percent.to_string().as_str()),
                ("device_id", device_id),
            ])
            .send()
            .await
            .map_err(|e| format!("Spotify API error: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Spotify API error: {e}"))?;
        Ok(())
    }
}

fn now_playing_line(prefix: &str, track: &Track) -> String {
    format!(
        "{prefix}: {} by {} from the album {}. [TRACK_ID:{}]",
        track.name,
        track.artist_names(),
        track.album.name,
        track.id
    )
}

fn track_data(track: &Track) -> serde_json::Value {
    serde_json::json!({ "track_id": track.id })
}

/// `search_tracks` tool
pub struct SearchTracksTool {
    client: Arc<SpotifyClient>,
}

impl SearchTracksTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for SearchTracksTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_tracks".into(),
            description: "Search for tracks on Spotify".into(),
            parameters: vec![
                ParameterSchema {
                    name: "query".into(),
                    param_type: "string".into(),
                    description: "Track or artist to search for".into(),
                    required: true,
                    default: None,
                },
                ParameterSchema {
                    name: "limit".into(),
                    param_type: "integer".into(),
                    description: "Maximum results (up to 10)".into(),
                    required: false,
                    default: Some(serde_json::json!(5)),
                },
            ],
            timeout: Duration::from_secs(15),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(query) = str_arg(call, "query") else {
            return Ok(ToolResult::failure(
                "search_tracks",
                "Please provide a search query",
            ));
        };
        let limit = call
            .arguments
            .get("limit")
            .and_then(serde_json::Value::as_u64)
            .map_or(5, |n| (n as usize).min(10));

        let tracks = match self.client.search_tracks(query, limit).await {
            Ok(tracks) => tracks,
            Err(msg) => return Ok(ToolResult::failure("search_tracks", msg)),
        };
        if tracks.is_empty() {
            return Ok(ToolResult::success(
                "search_tracks",
                format!("No tracks found for '{query}'"),
            ));
        }

        let formatted: Vec<String> = tracks
            .iter()
            .enumerate()
            .map(|(i, track)| {
                let url = track
                    .external_urls
                    .get("spotify")
                    .map(String::as_str)
                    .unwrap_or_default();
                format!(
                    "{}. {} by {}\n   Album: {}\n   Popularity: {}/100\n   Spotify: {}",
                    i + 1,
                    track.name,
                    track.artist_names(),
                    track.album.name,
                    track.popularity,
                    url
                )
            })
            .collect();

        Ok(ToolResult::success("search_tracks", formatted.join("\n\n")))
    }
}

/// `play_track` tool
pub struct PlayTrackTool {
    client: Arc<SpotifyClient>,
}

impl PlayTrackTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for PlayTrackTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "play_track".into(),
            description: "Search Spotify and play the best matching track".into(),
            parameters: vec![ParameterSchema {
                name: "query".into(),
                param_type: "string".into(),
                description: "Song and/or artist name".into(),
                required: true,
                default: None,
            }],
            timeout: Duration::from_secs(20),
            has_side_effects: true,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(query) = str_arg(call, "query") else {
            return Ok(ToolResult::failure(
                "play_track",
                "Please provide a song or artist name",
            ));
        };

        let device = match self.client.active_device().await {
            Ok(Some(device)) => device,
            Ok(None) => {
                return Ok(ToolResult::failure(
                    "play_track",
                    "No active Spotify device found. Please open Spotify on a device first.",
                ));
            }
            Err(msg) => return Ok(ToolResult::failure("play_track", msg)),
        };

        let tracks = match self.client.search_tracks(query, 10).await {
            Ok(tracks) => tracks,
            Err(msg) => return Ok(ToolResult::failure("play_track", msg)),
        };
        let Some(track) = best_match(query, tracks) else {
            return Ok(ToolResult::failure(
                "play_track",
                format!(
                    "No track found for '{query}'. Try being more specific or use \
                     different keywords."
                ),
            ));
        };

        // A playback hiccup still surfaces the matched track so the
        // client can render its embed.
        if let Err(msg) = self.client.start_playback(&device, &track.uri).await {
            tracing::warn!(track = %track.id, "playback failed: {msg}");
        }

        Ok(
            ToolResult::success("play_track", now_playing_line("Now playing", &track))
                .with_data(track_data(&track)),
        )
    }
}

/// `pause_music` tool
pub struct PauseMusicTool {
    client: Arc<SpotifyClient>,
}

impl PauseMusicTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for PauseMusicTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "pause_music".into(),
            description: "Pause current Spotify playback".into(),
            parameters: Vec::new(),
            timeout: Duration::from_secs(10),
            has_side_effects: true,
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        match self.client.pause().await {
            Ok(()) => Ok(ToolResult::success("pause_music", "Playback paused")),
            Err(msg) => Ok(ToolResult::failure("pause_music", msg)),
        }
    }
}

/// `skip_track` tool
pub struct SkipTrackTool {
    client: Arc<SpotifyClient>,
}

impl SkipTrackTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for SkipTrackTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "skip_track".into(),
            description: "Skip to the next track on Spotify".into(),
            parameters: Vec::new(),
            timeout: Duration::from_secs(10),
            has_side_effects: true,
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        match self.client.next_track().await {
            Ok(()) => Ok(ToolResult::success("skip_track", "Skipped to next track")),
            Err(msg) => Ok(ToolResult::failure("skip_track", msg)),
        }
    }
}

/// `current_track` tool
pub struct CurrentTrackTool {
    client: Arc<SpotifyClient>,
}

impl CurrentTrackTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for CurrentTrackTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "current_track".into(),
            description: "Get the currently playing Spotify track".into(),
            parameters: Vec::new(),
            timeout: Duration::from_secs(10),
            // Playback state is volatile; never serve it from cache
            has_side_effects: true,
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        match self.client.currently_playing().await {
            Ok(Some(track)) => Ok(ToolResult::success(
                "current_track",
                now_playing_line("Currently playing", &track),
            )
            .with_data(track_data(&track))),
            Ok(None) => Ok(ToolResult::success(
                "current_track",
                "Nothing is currently playing",
            )),
            Err(msg) => Ok(ToolResult::failure("current_track", msg)),
        }
    }
}

/// `set_volume` tool
pub struct SetVolumeTool {
    client: Arc<SpotifyClient>,
}

impl SetVolumeTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for SetVolumeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "set_volume".into(),
            description: "Set Spotify playback volume (0-100)".into(),
            parameters: vec![ParameterSchema {
                name: "percent".into(),
                param_type: "integer".into(),
                description: "Volume percent, 0 to 100".into(),
                required: true,
                default: None,
            }],
            timeout: Duration::from_secs(10),
            has_side_effects: true,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(percent) = call
            .arguments
            .get("percent")
            .and_then(serde_json::Value::as_u64)
            .filter(|p| *p <= 100)
        else {
            return Ok(ToolResult::failure(
                "set_volume",
                "Volume must be between 0 and 100",
            ));
        };

        let device = match self.client.active_device().await {
            Ok(Some(device)) => device,
            Ok(None) => return Ok(ToolResult::failure("set_volume", "No active device found")),
            Err(msg) => return Ok(ToolResult::failure("set_volume", msg)),
        };

        match self.client.set_volume(percent as u32, &device).await {
            Ok(()) => Ok(ToolResult::success(
                "set_volume",
                format!("Volume set to {percent}%"),
            )),
            Err(msg) => Ok(ToolResult::failure("set_volume", msg)),
        }
    }
}

/// `add_to_playlist` tool
pub struct AddToPlaylistTool {
    client: Arc<SpotifyClient>,
}

impl AddToPlaylistTool {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for AddToPlaylistTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "add_to_playlist".into(),
            description: "Add a track to a Spotify playlist, creating the playlist if needed"
                .into(),
            parameters: vec![
                ParameterSchema {
                    name: "track_query".into(),
                    param_type: "string".into(),
                    description: "Song and/or artist name to add".into(),
                    required: true,
                    default: None,
                },
                ParameterSchema {
                    name: "playlist_name".into(),
                    param_type: "string".into(),
                    description: "Name of the target playlist".into(),
                    required: true,
                    default: None,
                },
            ],
            timeout: Duration::from_secs(20),
            has_side_effects: true,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(query) = str_arg(call, "track_query") else {
            return Ok(ToolResult::failure(
                "add_to_playlist",
                "Please provide a track to add",
            ));
        };
        let Some(playlist_name) = str_arg(call, "playlist_name") else {
            return Ok(ToolResult::failure(
                "add_to_playlist",
                "Please provide a playlist name",
            ));
        };

        let tracks = match self.client.search_tracks(query, 1).await {
            Ok(tracks) => tracks,
            Err(msg) => return Ok(ToolResult::failure("add_to_playlist", msg)),
        };
        let Some(track) = tracks.into_iter().next() else {
            return Ok(ToolResult::failure(
                "add_to_playlist",
                format!("Track not found: {query}"),
            ));
        };

        let playlist = match self.client.find_or_create_playlist(playlist_name).await {
            Ok(playlist) => playlist,
            Err(msg) => return Ok(ToolResult::failure("add_to_playlist", msg)),
        };
        if let Err(msg) = self.client.add_to_playlist(&playlist.id, &track.uri).await {
            return Ok(ToolResult::failure("add_to_playlist", msg));
        }

        Ok(ToolResult::success(
            "add_to_playlist",
            format!("Added '{}' to playlist '{}'", track.name, playlist.name),
        )
        .with_data(track_data(&track)))
    }
}

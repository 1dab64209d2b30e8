//! Chat Gateway HTTP Server
//!
//! Axum-based gateway in front of heterogeneous chat models: routing
//! with fallback, a tool-calling agent loop, response/tool caching,
//! and durable session persistence.

mod auth;
mod engine;
mod handlers;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_core::{Agent, AgentConfig, ChatProvider, ResponseCache, RouterConfig, ToolRegistry};
use gateway_runtime::{
    GithubProvider, OllamaProvider, SarvamProvider,
    tools::{
        AddToPlaylistTool, CurrentTrackTool, LatestNewsTool, PauseMusicTool, PlayTrackTool,
        SearchTracksTool, SetVolumeTool, SkipTrackTool, SpotifyClient, WeatherTool, WebSearchTool,
        WikipediaTool,
    },
};
use gateway_store::{FileBackend, MemoryBackend, PersistenceManager, SessionBackend};

use crate::engine::Orchestrator;
use crate::handlers::{
    append_message, chat, create_session, delete_session, get_session, health_check,
    list_models, list_sessions, session_messages, stats,
};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    // Providers
    let ollama = Arc::new(OllamaProvider::from_env());
    match ollama.health_check().await {
        Ok(true) => {
            tracing::info!("✓ Connected to Ollama");
            if let Ok(models) = ollama.list_models().await {
                for model in models {
                    tracing::info!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ Ollama not available - local models will fall back");
            tracing::warn!("  Make sure Ollama is running: ollama serve");
        }
    }

    let sarvam = Arc::new(SarvamProvider::from_env()?);
    if sarvam.health_check().await.unwrap_or(false) {
        tracing::info!("✓ Sarvam configured");
    } else {
        tracing::warn!("⚠ Sarvam not configured - cloud fallback disabled");
        tracing::warn!("  Set SARVAM_API_KEY in .env");
    }

    let github = Arc::new(GithubProvider::from_env()?);
    if github.health_check().await.unwrap_or(false) {
        tracing::info!("✓ GitHub Models configured");
    } else {
        tracing::warn!("⚠ GitHub Models not configured - hosted models disabled");
        tracing::warn!("  Set GITHUB_TOKEN (and optionally GITHUB_TOKEN2) in .env");
    }

    let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
    providers.insert("ollama".into(), ollama);
    providers.insert("sarvam".into(), sarvam);
    providers.insert("github".into(), github);

    // Tools
    let spotify = Arc::new(SpotifyClient::from_env()?);
    let mut tools = ToolRegistry::new();
    tools.register(WeatherTool::new()?);
    tools.register(WebSearchTool::new()?);
    tools.register(LatestNewsTool::new()?);
    tools.register(WikipediaTool::new()?);
    tools.register(SearchTracksTool::new(spotify.clone()));
    tools.register(PlayTrackTool::new(spotify.clone()));
    tools.register(PauseMusicTool::new(spotify.clone()));
    tools.register(SkipTrackTool::new(spotify.clone()));
    tools.register(CurrentTrackTool::new(spotify.clone()));
    tools.register(SetVolumeTool::new(spotify.clone()));
    tools.register(AddToPlaylistTool::new(spotify));

    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    // Session store: durable file backend when a data dir is set
    let backend: Arc<dyn SessionBackend> = match std::env::var("GATEWAY_DATA_DIR") {
        Ok(dir) if !dir.is_empty() => {
            tracing::info!("✓ Persisting sessions under {}", dir);
            Arc::new(FileBackend::open(dir).await?)
        }
        _ => {
            tracing::warn!("⚠ GATEWAY_DATA_DIR not set - sessions are in-memory only");
            Arc::new(MemoryBackend::new())
        }
    };
    let store = Arc::new(PersistenceManager::new(backend));

    // Engine
    let cache = Arc::new(ResponseCache::new(256));
    let agent = Agent::new(Arc::new(tools), cache.clone(), AgentConfig::default());
    let engine = Arc::new(Orchestrator::new(
        RouterConfig::standard(),
        providers,
        agent,
        cache,
        store.clone(),
    ));

    let auth_token = auth::expected_token();
    if auth_token.is_some() {
        tracing::info!("✓ Bearer authentication enabled");
    } else {
        tracing::warn!("⚠ GATEWAY_AUTH_TOKEN not set - running open");
    }

    let state = AppState {
        engine,
        store,
        auth_token,
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Bound on concurrently processed requests; turns waiting on slow
    // providers queue here instead of piling onto the upstreams
    let max_concurrency = std::env::var("GATEWAY_MAX_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(64);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/stats", get(stats))
        .route("/api/chat", post(chat))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route(
            "/api/sessions/{id}/messages",
            get(session_messages).post(append_message),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(max_concurrency))
        .with_state(state);

    // Start server
    let addr = std::env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 chat gateway running on http://{}", addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health                    - Health check");
    tracing::info!("  GET    /api/models                - List routable models");
    tracing::info!("  GET    /api/stats                 - Cache counters");
    tracing::info!("  POST   /api/chat                  - Send message");
    tracing::info!("  GET    /api/sessions              - List sessions");
    tracing::info!("  POST   /api/sessions              - Create session");
    tracing::info!("  GET    /api/sessions/{{id}}         - Fetch session");
    tracing::info!("  DELETE /api/sessions/{{id}}         - Delete session");
    tracing::info!("  GET    /api/sessions/{{id}}/messages - Session history");
    tracing::info!("  POST   /api/sessions/{{id}}/messages - Append message");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}

//! Chat Orchestrator
//!
//! Ties the pieces of a turn together: session resolution, model
//! routing, the response cache lookup, the agent loop, and tail
//! persistence of the new messages. Handlers stay thin; everything
//! with semantics lives here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use gateway_core::{
    Agent, CandidateProvider, ChatProvider, Conversation, GatewayError, Message, ResponseCache,
    Result, RouterConfig, Session, SessionId, SidePayload, TurnOutcome,
    cache::{CacheStats, response_key},
    router::{ModelEntry, implies_tool_need},
};
use gateway_store::PersistenceManager;

/// TTL for cached pure-chat responses
const RESPONSE_TTL: Duration = Duration::from_secs(300);

/// Sentinel for turns that must not enter the response cache
const UNCACHEABLE: &str = "response not cacheable";

/// Result of one chat turn, ready for the wire
#[derive(Clone, Debug)]
pub struct ChatOutcome {
    pub text: String,
    pub session_id: SessionId,
    pub model_id: String,
    pub tools_used: Vec<String>,
    pub side_payload: Option<SidePayload>,
    pub cached: bool,
}

/// The gateway's request engine
pub struct Orchestrator {
    router: RouterConfig,
    providers: HashMap<String, Arc<dyn ChatProvider>>,
    agent: Agent,
    cache: Arc<ResponseCache>,
    store: Arc<PersistenceManager>,
}

impl Orchestrator {
    pub fn new(
        router: RouterConfig,
        providers: HashMap<String, Arc<dyn ChatProvider>>,
        agent: Agent,
        cache: Arc<ResponseCache>,
        store: Arc<PersistenceManager>,
    ) -> Self {
        Self {
            router,
            providers,
            agent,
            cache,
            store,
        }
    }

    pub fn model_catalog(&self) -> &[ModelEntry] {
        self.router.models()
    }

    /// Health of every registered provider, by provider id
    pub async fn provider_health(&self) -> HashMap<String, bool> {
        let mut health = HashMap::new();
        for (id, provider) in &self.providers {
            let healthy = provider.health_check().await.unwrap_or(false);
            health.insert(id.clone(), healthy);
        }
        health
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Run one chat turn.
    ///
    /// `requested_model` of `None` or `"auto"` routes by prompt
    /// content. An unknown `session_id` starts a fresh session rather
    /// than failing, matching client retry behavior after a wipe.
    pub async fn chat(
        &self,
        message: &str,
        requested_model: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<ChatOutcome> {
        let wants_tools = implies_tool_need(message);
        let requested = requested_model.unwrap_or("auto");
        let model_id = if requested == "auto" {
            self.router.resolve_auto(message).to_string()
        } else {
            requested.to_string()
        };

        let (session, fresh) = self.resolve_session(session_id, message, &model_id).await?;

        let candidates = self.resolve_candidates(&model_id, wants_tools)?;
        let outcome = self
            .run_cached_turn(&candidates, &session, message, fresh, &model_id)
            .await?;

        self.persist_tail(&session, message, fresh, &outcome.turn);

        Ok(ChatOutcome {
            text: outcome.turn.text,
            session_id: session.id,
            model_id: outcome.turn.model_id,
            tools_used: outcome.turn.tools_used,
            side_payload: outcome.turn.side_payload,
            cached: outcome.cached,
        })
    }

    async fn resolve_session(
        &self,
        session_id: Option<&str>,
        message: &str,
        model_id: &str,
    ) -> Result<(Session, bool)> {
        if let Some(id) = session_id {
            if let Some(session) = self.store.get_session(&SessionId::from_string(id)).await? {
                return Ok((session, false));
            }
            tracing::debug!(session = id, "unknown session id, starting fresh");
        }
        let session = self
            .store
            .create_session(Message::user(message), model_id)
            .await?;
        Ok((session, true))
    }

    /// Map router candidates to their registered providers
    fn resolve_candidates(
        &self,
        model_id: &str,
        wants_tools: bool,
    ) -> Result<Vec<CandidateProvider>> {
        let candidates: Vec<CandidateProvider> = self
            .router
            .select_candidates(model_id, wants_tools)
            .into_iter()
            .filter_map(|candidate| {
                self.providers
                    .get(&candidate.provider_id)
                    .map(|provider| CandidateProvider {
                        candidate,
                        provider: provider.clone(),
                    })
            })
            .collect();

        if candidates.is_empty() {
            return Err(GatewayError::Config(
                "no provider registered for any routing candidate".into(),
            ));
        }
        Ok(candidates)
    }

    /// Working conversation for the turn: persisted history plus the
    /// new user message (already present when the session is fresh).
    fn build_conversation(session: &Session, message: &str, fresh: bool) -> Conversation {
        let mut conversation = Conversation::new();
        for msg in &session.messages {
            conversation.push(msg.clone());
        }
        if !fresh {
            conversation.push(Message::user(message));
        }
        conversation
    }

    /// Run the turn through the single-flight response cache.
    ///
    /// Only clean pure-chat finalizations are cached: a turn that used
    /// tools, carried a side payload, or was truncated is returned but
    /// never stored, so replays always re-execute their effects.
    /// Follow-up turns skip the cache entirely: their answer depends on
    /// session history the prompt-only key cannot see, and must never
    /// be served to another session sending the same literal text.
    async fn run_cached_turn(
        &self,
        candidates: &[CandidateProvider],
        session: &Session,
        message: &str,
        fresh: bool,
        model_id: &str,
    ) -> Result<CachedTurn> {
        if !fresh {
            let mut conversation = Self::build_conversation(session, message, fresh);
            let turn = self.agent.run_turn(candidates, &mut conversation).await?;
            return Ok(CachedTurn { turn, cached: false });
        }

        let key = response_key(model_id, message);
        let stash: StdMutex<Option<TurnOutcome>> = StdMutex::new(None);

        let cached = self
            .cache
            .get_or_compute(key, RESPONSE_TTL, || async {
                let mut conversation = Self::build_conversation(session, message, fresh);
                let outcome = self.agent.run_turn(candidates, &mut conversation).await?;

                let cacheable = !outcome.truncated
                    && outcome.tools_used.is_empty()
                    && outcome.side_payload.is_none();
                let value = serde_json::json!({
                    "text": outcome.text,
                    "model_id": outcome.model_id,
                });

                let mut slot = stash.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                *slot = Some(outcome);
                drop(slot);

                if cacheable {
                    Ok(value)
                } else {
                    Err(GatewayError::Other(UNCACHEABLE.into()))
                }
            })
            .await;

        let fresh_outcome = stash
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        match (cached, fresh_outcome) {
            // This caller ran the turn and the result was stored
            (Ok(_), Some(turn)) => Ok(CachedTurn { turn, cached: false }),
            // Served from cache (ready entry or another caller's flight)
            (Ok(value), None) => Ok(CachedTurn {
                turn: TurnOutcome {
                    text: value
                        .get("text")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    tools_used: Vec::new(),
                    side_payload: None,
                    model_id: value
                        .get("model_id")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or(model_id)
                        .to_string(),
                    rounds: 0,
                    truncated: false,
                },
                cached: true,
            }),
            // This caller ran the turn; result was deliberately not cached
            (Err(_), Some(turn)) => Ok(CachedTurn { turn, cached: false }),
            // Waited on a flight that turned out uncacheable: run directly
            (Err(err), None) if err.to_string() == UNCACHEABLE => {
                let mut conversation = Self::build_conversation(session, message, fresh);
                let turn = self.agent.run_turn(candidates, &mut conversation).await?;
                Ok(CachedTurn { turn, cached: false })
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Persist the turn's new messages off the request path. Appends
    /// are serialized per session by the store; a failed write degrades
    /// to memory inside the manager and is logged, never surfaced.
    fn persist_tail(&self, session: &Session, message: &str, fresh: bool, turn: &TurnOutcome) {
        let store = self.store.clone();
        let session_id = session.id.clone();

        let user_message = (!fresh).then(|| Message::user(message));
        let mut assistant = Message::assistant(&turn.text)
            .with_model(&turn.model_id)
            .with_tools_used(turn.tools_used.clone());
        if let Some(payload) = &turn.side_payload {
            assistant = assistant.with_side_payload(payload.clone());
        }

        tokio::spawn(async move {
            if let Some(msg) = user_message {
                if let Err(err) = store.append_message(&session_id, msg).await {
                    tracing::warn!(session = %session_id, error = %err, "user message not durably saved");
                }
            }
            if let Err(err) = store.append_message(&session_id, assistant).await {
                tracing::warn!(session = %session_id, error = %err, "assistant message not durably saved");
            }
        });
    }
}

struct CachedTurn {
    turn: TurnOutcome,
    cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::provider::{Completion, GenerationOptions, ModelInfo, ProviderInfo};
    use gateway_core::{AgentConfig, ToolRegistry};
    use gateway_store::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        reply: String,
        calls: AtomicUsize,
        last_dispatch_len: AtomicUsize,
    }

    impl CountingProvider {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.into(),
                calls: AtomicUsize::new(0),
                last_dispatch_len: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for CountingProvider {
        async fn info(&self) -> Result<ProviderInfo> {
            Ok(ProviderInfo {
                name: "counting".into(),
                models: Vec::new(),
                supports_tools: true,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(
            &self,
            messages: &[Message],
            options: &GenerationOptions,
        ) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_dispatch_len.store(messages.len(), Ordering::SeqCst);
            Ok(Completion {
                content: self.reply.clone(),
                model: options.model.clone(),
                usage: None,
                finish_reason: None,
            })
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    fn orchestrator_with(provider: Arc<dyn ChatProvider>) -> Orchestrator {
        let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert("ollama".into(), provider.clone());
        providers.insert("sarvam".into(), provider);

        let cache = Arc::new(ResponseCache::new(64));
        Orchestrator::new(
            RouterConfig::standard(),
            providers,
            Agent::new(
                Arc::new(ToolRegistry::new()),
                cache.clone(),
                AgentConfig::default(),
            ),
            cache,
            Arc::new(PersistenceManager::new(Arc::new(MemoryBackend::new()))),
        )
    }

    async fn wait_for_message_count(
        store: &PersistenceManager,
        id: &SessionId,
        expected: usize,
    ) -> Session {
        for _ in 0..50 {
            if let Ok(Some(session)) = store.get_session(id).await {
                if session.message_count() >= expected {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {expected} messages");
    }

    #[tokio::test]
    async fn test_chat_creates_session_and_persists_turn() {
        let engine = orchestrator_with(CountingProvider::new("Hello there."));

        let outcome = engine.chat("hi", None, None).await.unwrap();
        assert_eq!(outcome.text, "Hello there.");
        assert!(!outcome.cached);

        let session =
            wait_for_message_count(&engine.store, &outcome.session_id, 2).await;
        assert_eq!(session.messages[0].content, "hi");
        assert_eq!(session.messages[1].content, "Hello there.");
        assert_eq!(session.messages[1].model.as_deref(), Some("ollama-qwen2.5"));
    }

    #[tokio::test]
    async fn test_followup_continues_existing_session() {
        let engine = orchestrator_with(CountingProvider::new("Sure."));

        let first = engine.chat("explain this code", None, None).await.unwrap();
        wait_for_message_count(&engine.store, &first.session_id, 2).await;

        let second = engine
            .chat("now simplify that code", None, Some(first.session_id.as_str()))
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);

        let session = wait_for_message_count(&engine.store, &first.session_id, 4).await;
        assert_eq!(session.messages[2].content, "now simplify that code");
    }

    #[tokio::test]
    async fn test_identical_pure_chat_prompt_is_served_from_cache() {
        let provider = CountingProvider::new("A fixed answer.");
        let engine = orchestrator_with(provider.clone());

        let first = engine.chat("tell me something fixed", None, None).await.unwrap();
        let second = engine.chat("tell me something fixed", None, None).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.text, "A fixed answer.");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_followup_dispatch_carries_session_history() {
        let provider = CountingProvider::new("Sure, continuing.");
        let engine = orchestrator_with(provider.clone());

        let first = engine.chat("tell me about rust", None, None).await.unwrap();
        wait_for_message_count(&engine.store, &first.session_id, 2).await;

        engine
            .chat("go on", None, Some(first.session_id.as_str()))
            .await
            .unwrap();

        // System prompt + first user + first assistant + follow-up user
        assert!(provider.last_dispatch_len.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_followup_answers_are_not_shared_across_sessions() {
        let provider = CountingProvider::new("Continuing.");
        let engine = orchestrator_with(provider.clone());

        let a = engine.chat("hello", None, None).await.unwrap();
        wait_for_message_count(&engine.store, &a.session_id, 2).await;
        let b = engine.chat("hi there", None, None).await.unwrap();
        wait_for_message_count(&engine.store, &b.session_id, 2).await;

        let a2 = engine
            .chat("go on", None, Some(a.session_id.as_str()))
            .await
            .unwrap();
        let b2 = engine
            .chat("go on", None, Some(b.session_id.as_str()))
            .await
            .unwrap();

        // Identical literal text, but each session computes its own turn
        assert!(!a2.cached);
        assert!(!b2.cached);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_auto_routing_picks_technical_model() {
        let engine = orchestrator_with(CountingProvider::new("done"));
        let outcome = engine.chat("debug this algorithm", None, None).await.unwrap();
        assert_eq!(outcome.model_id, "ollama-qwen2.5");
    }

    #[tokio::test]
    async fn test_unknown_session_id_starts_fresh() {
        let engine = orchestrator_with(CountingProvider::new("fresh start"));
        let outcome = engine
            .chat("hello", None, Some("no-such-session"))
            .await
            .unwrap();
        assert_ne!(outcome.session_id.as_str(), "no-such-session");
    }

    struct DownBackend;

    #[async_trait]
    impl gateway_store::SessionBackend for DownBackend {
        async fn put_session(&self, _: &Session) -> gateway_store::Result<()> {
            Err(gateway_store::StoreError::Transient("down".into()))
        }
        async fn get_session(
            &self,
            _: &SessionId,
        ) -> gateway_store::Result<Option<Session>> {
            Err(gateway_store::StoreError::Transient("down".into()))
        }
        async fn list_sessions(&self) -> gateway_store::Result<Vec<Session>> {
            Err(gateway_store::StoreError::Transient("down".into()))
        }
        async fn delete_session(&self, _: &SessionId) -> gateway_store::Result<()> {
            Err(gateway_store::StoreError::Transient("down".into()))
        }
        async fn append_message(
            &self,
            _: &SessionId,
            _: &Message,
        ) -> gateway_store::Result<()> {
            Err(gateway_store::StoreError::Transient("down".into()))
        }
    }

    #[tokio::test]
    async fn test_chat_survives_a_down_store() {
        let provider = CountingProvider::new("still answering");
        let mut providers: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        providers.insert("ollama".into(), provider.clone());
        providers.insert("sarvam".into(), provider);

        let cache = Arc::new(ResponseCache::new(64));
        let engine = Orchestrator::new(
            RouterConfig::standard(),
            providers,
            Agent::new(
                Arc::new(ToolRegistry::new()),
                cache.clone(),
                AgentConfig::default(),
            ),
            cache,
            Arc::new(PersistenceManager::with_retry(
                Arc::new(DownBackend),
                gateway_core::RetryPolicy::new(
                    2,
                    Duration::from_millis(1),
                    gateway_core::retry::Backoff::Fixed,
                ),
            )),
        );

        let outcome = engine.chat("hello", None, None).await.unwrap();
        assert_eq!(outcome.text, "still answering");

        // The turn survives in the in-memory fallback
        let session = wait_for_message_count(&engine.store, &outcome.session_id, 2).await;
        assert_eq!(session.messages[1].content, "still answering");
    }
}

//! Agent Core (Tool-Calling Loop)
//!
//! The central state machine of the gateway. Each round sends the
//! conversation plus tool schemas to the current provider candidate,
//! inspects the reply for tool-call intents, executes tools through
//! the cache's single-flight wrapper, folds results back into the
//! conversation, and repeats until a plain-text answer or a bound is
//! reached.
//!
//! Failure handling is local wherever possible: a provider timeout or
//! transport error advances the fallback chain, a failed tool call is
//! narrated back to the model as tool output, and hitting the round
//! bound or the turn deadline finalizes with the best partial text.
//! Only exhausting every provider candidate is fatal for the turn.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::cache::{ResponseCache, tool_key};
use crate::error::{GatewayError, Result};
use crate::message::{Conversation, Message, Role, SidePayload};
use crate::provider::{ChatProvider, GenerationOptions};
use crate::router::ProviderCandidate;
use crate::tool::{ToolCall, ToolRegistry, ToolResult};

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant.

When you need to use a tool, respond with a JSON block in this exact format:
```tool
{"tool": "tool_name", "arguments": {"arg1": "value1"}}
```

After receiving tool results, synthesize them into a helpful response.
If you can answer directly without tools, do so.
If a tool fails, explain the failure and offer an alternative.
Be concise and accurate."#;

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// System prompt template
    pub system_prompt: String,

    /// Maximum tool rounds before forcing finalization
    pub max_rounds: usize,

    /// Hard timeout for a single provider call
    pub provider_timeout: Duration,

    /// Wall-clock budget for the whole turn (all rounds included)
    pub turn_deadline: Duration,

    /// TTL for cached tool results
    pub tool_result_ttl: Duration,

    /// Whether to append tool descriptions to the system prompt
    pub inject_tool_descriptions: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_rounds: 6,
            provider_timeout: Duration::from_secs(30),
            turn_deadline: Duration::from_secs(120),
            tool_result_ttl: Duration::from_secs(300),
            inject_tool_descriptions: true,
        }
    }
}

/// A router candidate resolved to its concrete provider
#[derive(Clone)]
pub struct CandidateProvider {
    pub candidate: ProviderCandidate,
    pub provider: Arc<dyn ChatProvider>,
}

/// Final output of one turn
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Final assistant text (legacy media tags stripped)
    pub text: String,

    /// De-duplicated tool names invoked during the turn, in first-use order
    pub tools_used: Vec<String>,

    /// Structured side-payload promoted from a tool result
    pub side_payload: Option<SidePayload>,

    /// Public model id of the candidate that answered
    pub model_id: String,

    /// Tool rounds consumed
    pub rounds: usize,

    /// Whether the loop was cut short (round bound or deadline)
    pub truncated: bool,
}

/// The tool-calling agent
pub struct Agent {
    tools: Arc<ToolRegistry>,
    cache: Arc<ResponseCache>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(tools: Arc<ToolRegistry>, cache: Arc<ResponseCache>, config: AgentConfig) -> Self {
        Self {
            tools,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Build the full system prompt including tool descriptions
    fn build_system_prompt(&self, supports_tools: bool) -> String {
        let mut prompt = self.config.system_prompt.clone();
        if supports_tools && self.config.inject_tool_descriptions && !self.tools.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&self.tools.prompt_section());
        }
        prompt
    }

    /// Run one turn against an ordered candidate list.
    ///
    /// The conversation must end with the user message for this turn;
    /// a system prompt is inserted at the head if absent. Mid-loop
    /// assistant and tool messages are appended to the conversation as
    /// working context but only the returned outcome is meant to be
    /// persisted.
    pub async fn run_turn(
        &self,
        candidates: &[CandidateProvider],
        conversation: &mut Conversation,
    ) -> Result<TurnOutcome> {
        if candidates.is_empty() {
            return Err(GatewayError::Config("no provider candidates".into()));
        }

        if conversation.messages().first().map(|m| &m.role) != Some(&Role::System) {
            let prompt = self.build_system_prompt(candidates[0].candidate.supports_tools);
            conversation.messages_mut().insert(0, Message::system(prompt));
        }
        conversation.truncate_to_fit();

        let deadline = Instant::now() + self.config.turn_deadline;
        let mut state = TurnState::new(&candidates[0].candidate.model_id);
        let mut current = 0usize;

        loop {
            if state.rounds >= self.config.max_rounds {
                tracing::warn!(rounds = state.rounds, "tool loop exhausted");
                return Ok(state.finalize_truncated(
                    "I reached my tool-use limit before fully finishing; here is what I have so far.",
                ));
            }

            // Dispatch, falling back along the candidate list
            let (completion, chosen) = match self
                .dispatch(candidates, current, deadline, conversation.messages())
                .await
            {
                    Ok(ok) => ok,
                    Err(err) => {
                        if state.best_partial.is_some() {
                            // A provider died mid-loop but we already
                            // have usable text from an earlier round.
                            return Ok(state.finalize_truncated(
                                "I lost the AI service partway through; here is what I have so far.",
                            ));
                        }
                        return Err(err);
                    }
                };
            current = chosen;
            state.model_id = candidates[current].candidate.model_id.clone();
            state.rounds += 1;

            let calls = parse_tool_calls(&completion.content);
            if calls.is_empty() {
                return Ok(state.finalize(&completion.content));
            }

            conversation.push(Message::assistant(&completion.content));
            state.best_partial = Some(strip_tool_blocks(&completion.content));

            // Execute all requested calls concurrently; each failure is
            // scoped to its own call.
            let results = futures::future::join_all(
                calls.iter().map(|call| self.execute_tool(call, deadline)),
            )
            .await;

            for (call, result) in calls.iter().zip(results) {
                state.record_tool(&call.name);
                if let Some(track_id) = result
                    .data
                    .as_ref()
                    .and_then(|d| d.get("track_id"))
                    .and_then(Value::as_str)
                {
                    state.side_payload = Some(SidePayload::SpotifyTrack {
                        track_id: track_id.to_string(),
                    });
                }
                conversation.push(Message::tool(format_tool_result(&result), result.id.clone()));
            }

            if Instant::now() >= deadline {
                tracing::warn!("turn deadline expired mid-loop");
                return Ok(state.finalize_truncated(
                    "I ran out of time before fully finishing; here is what I have so far.",
                ));
            }
            // Loop back to Dispatch against the same provider
        }
    }

    /// Send the conversation to the current candidate, advancing along
    /// the chain on timeout or transport error.
    async fn dispatch(
        &self,
        candidates: &[CandidateProvider],
        start: usize,
        deadline: Instant,
        messages: &[Message],
    ) -> Result<(crate::provider::Completion, usize)> {
        let mut last_error = String::new();

        for (idx, cp) in candidates.iter().enumerate().skip(start) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::ProviderTimeout(cp.candidate.model_id.clone()));
            }
            let budget = self.config.provider_timeout.min(remaining);

            let options = GenerationOptions {
                model: cp.candidate.upstream_model.clone(),
                temperature: cp.candidate.temperature,
                ..Default::default()
            };

            tracing::debug!(
                model = %cp.candidate.model_id,
                round_budget_ms = budget.as_millis() as u64,
                "dispatching to provider"
            );

            // Send conversation state to the provider under a hard timeout.
            // Tool messages are already folded into the history.
            match tokio::time::timeout(budget, cp.provider.complete(messages, &options)).await {
                Ok(Ok(completion)) => return Ok((completion, idx)),
                Ok(Err(err)) => {
                    tracing::warn!(model = %cp.candidate.model_id, error = %err, "provider failed, falling back");
                    last_error = err.to_string();
                }
                Err(_) => {
                    tracing::warn!(model = %cp.candidate.model_id, "provider timed out, falling back");
                    last_error = format!("'{}' timed out", cp.candidate.model_id);
                }
            }
        }

        Err(GatewayError::AllProvidersFailed {
            model: candidates[start].candidate.model_id.clone(),
            detail: last_error,
        })
    }

    /// Execute a single tool call through the cache single-flight
    /// wrapper, under the tool's own timeout. Never returns an error:
    /// failures become structured failure results for the model to
    /// narrate.
    async fn execute_tool(&self, call: &ToolCall, deadline: Instant) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::failure(&call.name, format!("unknown tool '{}'", call.name))
                .with_id(call.id.clone().unwrap_or_default());
        };

        if let Err(err) = tool.validate(call) {
            return ToolResult::failure(&call.name, err.to_string())
                .with_id(call.id.clone().unwrap_or_default());
        }

        let schema = tool.schema();
        let budget = schema
            .timeout
            .min(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)));

        let run = || async {
            match tokio::time::timeout(budget, tool.execute(call)).await {
                Ok(Ok(result)) if result.success => Ok(result),
                Ok(Ok(result)) => Err(GatewayError::ToolExecution(result.output)),
                Ok(Err(err)) => Err(GatewayError::ToolExecution(err.to_string())),
                Err(_) => Err(GatewayError::ToolExecution(format!(
                    "tool '{}' timed out after {}s",
                    call.name,
                    schema.timeout.as_secs()
                ))),
            }
        };

        let outcome = if schema.has_side_effects {
            // Side-effecting calls must actually run every time
            run().await.and_then(|r| serde_json::to_value(&r).map_err(Into::into))
        } else {
            let key = tool_key(&call.name, &call.arguments);
            self.cache
                .get_or_compute(key, self.config.tool_result_ttl, || async {
                    let result = run().await?;
                    serde_json::to_value(&result).map_err(Into::into)
                })
                .await
        };

        match outcome {
            Ok(value) => match serde_json::from_value::<ToolResult>(value) {
                Ok(result) => result.with_id(call.id.clone().unwrap_or_default()),
                Err(err) => ToolResult::failure(&call.name, format!("corrupt tool result: {err}")),
            },
            Err(err) => {
                tracing::debug!(tool = %call.name, error = %err, "tool call failed");
                ToolResult::failure(&call.name, err.to_string())
                    .with_id(call.id.clone().unwrap_or_default())
            }
        }
    }
}

/// Mutable per-turn bookkeeping
struct TurnState {
    model_id: String,
    rounds: usize,
    tools_used: Vec<String>,
    side_payload: Option<SidePayload>,
    best_partial: Option<String>,
}

impl TurnState {
    fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            rounds: 0,
            tools_used: Vec::new(),
            side_payload: None,
            best_partial: None,
        }
    }

    fn record_tool(&mut self, name: &str) {
        if !self.tools_used.iter().any(|t| t == name) {
            self.tools_used.push(name.to_string());
        }
    }

    fn finalize(mut self, text: &str) -> TurnOutcome {
        let (clean, tagged_id) = extract_track_tag(text);
        if self.side_payload.is_none() {
            // The inline tag is a legacy encoding; the structured
            // payload wins when both are present.
            self.side_payload = tagged_id.map(|track_id| SidePayload::SpotifyTrack { track_id });
        }
        TurnOutcome {
            text: clean,
            tools_used: self.tools_used,
            side_payload: self.side_payload,
            model_id: self.model_id,
            rounds: self.rounds,
            truncated: false,
        }
    }

    fn finalize_truncated(self, note: &str) -> TurnOutcome {
        let partial = self.best_partial.clone().unwrap_or_default();
        let text = if partial.trim().is_empty() {
            note.to_string()
        } else {
            format!("{}\n\n({note})", partial.trim())
        };
        let mut outcome = self.finalize(&text);
        outcome.truncated = true;
        outcome
    }
}

/// Parse every tool-call intent from a provider reply: all fenced
/// ```tool blocks, with a single inline-JSON object as fallback.
pub fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find("```tool") {
        let after = &rest[start + "```tool".len()..];
        let Some(end) = after.find("```") else { break };
        if let Ok(mut call) = serde_json::from_str::<ToolCall>(after[..end].trim()) {
            if call.id.is_none() {
                call.id = Some(uuid::Uuid::new_v4().to_string());
            }
            calls.push(call);
        }
        rest = &after[end + 3..];
    }

    if calls.is_empty() {
        if let Some(call) = parse_inline_tool_call(content) {
            calls.push(call);
        }
    }

    calls
}

/// Fallback for providers that emit a bare JSON object with a "tool" key
fn parse_inline_tool_call(content: &str) -> Option<ToolCall> {
    if !content.contains(r#""tool""#) {
        return None;
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<ToolCall>(&content[start..=end])
        .ok()
        .map(|mut call| {
            if call.id.is_none() {
                call.id = Some(uuid::Uuid::new_v4().to_string());
            }
            call
        })
}

/// Remove fenced tool blocks from partial text
fn strip_tool_blocks(content: &str) -> String {
    let mut out = String::new();
    let mut rest = content;
    while let Some(start) = rest.find("```tool") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "```tool".len()..];
        match after.find("```") {
            Some(end) => rest = &after[end + 3..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Extract and strip the legacy inline `[TRACK_ID:<22 chars>]` tag.
/// Returns the cleaned text and the first extracted id, if any.
pub fn extract_track_tag(text: &str) -> (String, Option<String>) {
    const MARKER: &str = "[TRACK_ID:";

    let mut clean = String::with_capacity(text.len());
    let mut track_id = None;
    let mut rest = text;

    while let Some(start) = rest.find(MARKER) {
        clean.push_str(&rest[..start]);
        let after = &rest[start + MARKER.len()..];
        match after.find(']') {
            Some(end) => {
                let id = &after[..end];
                if id.len() == 22 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
                    if track_id.is_none() {
                        track_id = Some(id.to_string());
                    }
                } else {
                    // Malformed tag: keep it verbatim
                    clean.push_str(&rest[start..start + MARKER.len() + end + 1]);
                }
                rest = &after[end + 1..];
            }
            None => {
                clean.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    clean.push_str(rest);

    (clean.trim().to_string(), track_id)
}

fn format_tool_result(result: &ToolResult) -> String {
    if result.success {
        format!("[Tool '{}' returned]\n{}", result.name, result.output)
    } else {
        format!("[Tool '{}' failed]\n{}", result.name, result.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Completion, ModelInfo, ProviderInfo};
    use crate::tool::{ParameterSchema, Tool, ToolSchema};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    enum Scripted {
        Reply(String),
        Fail,
        Hang,
    }

    struct ScriptedProvider {
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn replying(replies: &[&str]) -> Arc<Self> {
            Self::new(replies.iter().map(|r| Scripted::Reply((*r).into())).collect())
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn info(&self) -> Result<ProviderInfo> {
            Ok(ProviderInfo {
                name: "scripted".into(),
                models: Vec::new(),
                supports_tools: true,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(
            &self,
            _messages: &[Message],
            options: &GenerationOptions,
        ) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Scripted::Reply(content)) => Ok(Completion {
                    content,
                    model: options.model.clone(),
                    usage: None,
                    finish_reason: None,
                }),
                Some(Scripted::Fail) | None => {
                    Err(GatewayError::ProviderUnavailable("scripted failure".into()))
                }
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }
    }

    struct WeatherTool {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for WeatherTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "weather".into(),
                description: "Get current weather for a location".into(),
                parameters: vec![ParameterSchema {
                    name: "location".into(),
                    param_type: "string".into(),
                    description: "City name".into(),
                    required: true,
                    default: None,
                }],
                timeout: Duration::from_secs(5),
                has_side_effects: false,
            }
        }

        async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let location = call
                .arguments
                .get("location")
                .and_then(|v| v.as_str())
                .unwrap_or("somewhere");
            Ok(ToolResult::success(
                "weather",
                format!("Weather for {location}: 18°C, clear sky"),
            ))
        }
    }

    struct PlayTrackTool;

    #[async_trait]
    impl Tool for PlayTrackTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "play_track".into(),
                description: "Play a track".into(),
                parameters: vec![ParameterSchema {
                    name: "query".into(),
                    param_type: "string".into(),
                    description: "Track to play".into(),
                    required: true,
                    default: None,
                }],
                timeout: Duration::from_secs(5),
                has_side_effects: true,
            }
        }

        async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
            Ok(ToolResult::success(
                "play_track",
                "Now playing: So What by Miles Davis. [TRACK_ID:3n3Ppam7vgaVa1iaRUc9Lp]",
            )
            .with_data(serde_json::json!({"track_id": "3n3Ppam7vgaVa1iaRUc9Lp"})))
        }
    }

    fn agent_with(tools: ToolRegistry, config: AgentConfig) -> Agent {
        Agent::new(
            Arc::new(tools),
            Arc::new(ResponseCache::new(64)),
            config,
        )
    }

    fn candidate(model_id: &str, provider: Arc<dyn ChatProvider>) -> CandidateProvider {
        CandidateProvider {
            candidate: ProviderCandidate {
                model_id: model_id.into(),
                provider_id: "test".into(),
                upstream_model: model_id.into(),
                temperature: 0.2,
                supports_tools: true,
                rank: 0,
            },
            provider,
        }
    }

    fn weather_registry() -> (ToolRegistry, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(WeatherTool {
            invocations: invocations.clone(),
        });
        (registry, invocations)
    }

    const WEATHER_CALL: &str = "Let me check.\n```tool\n{\"tool\": \"weather\", \"arguments\": {\"location\": \"Paris\"}}\n```";

    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_fenced_tool_call() {
        let calls = parse_tool_calls(WEATHER_CALL);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "weather");
        assert_eq!(
            calls[0].arguments.get("location").and_then(Value::as_str),
            Some("Paris")
        );
        assert!(calls[0].id.is_some());
    }

    #[test]
    fn test_parse_multiple_tool_calls() {
        let content = "```tool\n{\"tool\": \"weather\", \"arguments\": {\"location\": \"Paris\"}}\n```\nand\n```tool\n{\"tool\": \"weather\", \"arguments\": {\"location\": \"Oslo\"}}\n```";
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_parse_inline_tool_call_fallback() {
        let calls = parse_tool_calls(r#"{"tool": "weather", "arguments": {"location": "Paris"}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "weather");
    }

    #[test]
    fn test_plain_text_has_no_tool_calls() {
        assert!(parse_tool_calls("The weather in Paris is mild.").is_empty());
    }

    #[test]
    fn test_extract_track_tag_strips_and_returns_id() {
        let (clean, id) =
            extract_track_tag("Now playing: So What. [TRACK_ID:3n3Ppam7vgaVa1iaRUc9Lp]");
        assert_eq!(clean, "Now playing: So What.");
        assert_eq!(id.as_deref(), Some("3n3Ppam7vgaVa1iaRUc9Lp"));
    }

    #[test]
    fn test_malformed_track_tag_is_left_alone() {
        let (clean, id) = extract_track_tag("see [TRACK_ID:short] here");
        assert_eq!(clean, "see [TRACK_ID:short] here");
        assert!(id.is_none());
    }

    // ------------------------------------------------------------------
    // Turn state machine
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_weather_tool_round_trip() {
        let (registry, invocations) = weather_registry();
        let agent = agent_with(registry, AgentConfig::default());
        let provider = ScriptedProvider::replying(&[
            WEATHER_CALL,
            "The weather in Paris is 18°C with a clear sky.",
        ]);
        let candidates = [candidate("ollama-qwen2.5", provider)];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("What's the weather in Paris?"));

        let outcome = agent.run_turn(&candidates, &mut conversation).await.unwrap();

        assert!(outcome.text.contains("Paris"));
        assert_eq!(outcome.tools_used, vec!["weather".to_string()]);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.rounds, 2);
        assert!(!outcome.truncated);
        assert_eq!(outcome.model_id, "ollama-qwen2.5");
    }

    #[tokio::test]
    async fn test_fallback_on_provider_failure() {
        let (registry, _) = weather_registry();
        let agent = agent_with(registry, AgentConfig::default());

        let dead = ScriptedProvider::new(vec![Scripted::Fail, Scripted::Fail]);
        let alive = ScriptedProvider::replying(&["Hello from the fallback."]);
        let candidates = [
            candidate("sarvam-m", dead),
            candidate("ollama-qwen2.5", alive),
        ];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("hi"));

        let outcome = agent.run_turn(&candidates, &mut conversation).await.unwrap();
        assert_eq!(outcome.model_id, "ollama-qwen2.5");
        assert!(outcome.text.contains("fallback"));
    }

    #[tokio::test]
    async fn test_fallback_on_provider_timeout() {
        let (registry, _) = weather_registry();
        let config = AgentConfig {
            provider_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let agent = agent_with(registry, config);

        let slow = ScriptedProvider::new(vec![Scripted::Hang]);
        let fast = ScriptedProvider::replying(&["Answered in time."]);
        let candidates = [candidate("ollama-llama3.1", slow), candidate("sarvam-m", fast)];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("hi"));

        let outcome = agent.run_turn(&candidates, &mut conversation).await.unwrap();
        assert_eq!(outcome.model_id, "sarvam-m");
    }

    #[tokio::test]
    async fn test_all_providers_failed_is_fatal() {
        let (registry, _) = weather_registry();
        let agent = agent_with(registry, AgentConfig::default());

        let dead_a = ScriptedProvider::new(vec![Scripted::Fail]);
        let dead_b = ScriptedProvider::new(vec![Scripted::Fail]);
        let candidates = [candidate("a", dead_a), candidate("b", dead_b)];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("hi"));

        let err = agent.run_turn(&candidates, &mut conversation).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllProvidersFailed { .. }));
    }

    #[tokio::test]
    async fn test_loop_terminates_at_round_bound() {
        let (registry, _) = weather_registry();
        let config = AgentConfig {
            max_rounds: 3,
            ..Default::default()
        };
        let agent = agent_with(registry, config);

        // Provider that always asks for another tool call
        let provider = ScriptedProvider::replying(&[
            WEATHER_CALL,
            WEATHER_CALL,
            WEATHER_CALL,
            WEATHER_CALL,
        ]);
        let candidates = [candidate("ollama-qwen2.5", provider.clone())];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("weather forever"));

        let outcome = agent.run_turn(&candidates, &mut conversation).await.unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.rounds, 3);
        assert!(!outcome.text.is_empty());
        assert!(provider.calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_invalid_tool_arguments_are_narrated_not_fatal() {
        let (registry, invocations) = weather_registry();
        let agent = agent_with(registry, AgentConfig::default());

        let bad_call = "```tool\n{\"tool\": \"weather\", \"arguments\": {}}\n```";
        let provider = ScriptedProvider::replying(&[
            bad_call,
            "I couldn't look that up because I was missing the location.",
        ]);
        let candidates = [candidate("ollama-qwen2.5", provider)];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("weather please"));

        let outcome = agent.run_turn(&candidates, &mut conversation).await.unwrap();
        assert!(!outcome.truncated);
        // The tool never executed, but the attempt is recorded
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.tools_used, vec!["weather".to_string()]);
        // The failure was narrated back to the model as tool output
        let narrated = conversation
            .messages()
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("failed"));
        assert!(narrated);
    }

    #[tokio::test]
    async fn test_side_payload_promoted_and_tag_stripped() {
        let mut registry = ToolRegistry::new();
        registry.register(PlayTrackTool);
        let agent = agent_with(registry, AgentConfig::default());

        let play_call = "```tool\n{\"tool\": \"play_track\", \"arguments\": {\"query\": \"So What\"}}\n```";
        let provider = ScriptedProvider::replying(&[
            play_call,
            "Now playing So What by Miles Davis. [TRACK_ID:3n3Ppam7vgaVa1iaRUc9Lp]",
        ]);
        let candidates = [candidate("ollama-qwen2.5", provider)];

        let mut conversation = Conversation::new();
        conversation.push(Message::user("play so what"));

        let outcome = agent.run_turn(&candidates, &mut conversation).await.unwrap();
        assert!(!outcome.text.contains("[TRACK_ID:"));
        assert_eq!(
            outcome.side_payload,
            Some(SidePayload::SpotifyTrack {
                track_id: "3n3Ppam7vgaVa1iaRUc9Lp".into()
            })
        );
        assert_eq!(outcome.tools_used, vec!["play_track".to_string()]);
    }

    #[tokio::test]
    async fn test_repeat_cacheable_tool_calls_share_one_execution() {
        let (registry, invocations) = weather_registry();
        let agent = agent_with(registry, AgentConfig::default());

        // Two turns, identical tool call: second is served from cache
        for _ in 0..2 {
            let provider = ScriptedProvider::replying(&[WEATHER_CALL, "Done."]);
            let candidates = [candidate("ollama-qwen2.5", provider)];
            let mut conversation = Conversation::new();
            conversation.push(Message::user("What's the weather in Paris?"));
            agent.run_turn(&candidates, &mut conversation).await.unwrap();
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }
}

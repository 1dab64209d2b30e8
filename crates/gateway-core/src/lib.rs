//! # gateway-core
//!
//! Orchestration core for the conversational AI gateway.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Orchestration Engine                     │
//! │  ┌──────────┐   ┌─────────────┐   ┌───────────────────────┐  │
//! │  │  Router/ │   │ Agent Core  │   │   ChatProvider        │  │
//! │  │ Fallback │──▶│ (tool loop) │──▶│   (per upstream)      │  │
//! │  └──────────┘   └──────┬──────┘   └───────────────────────┘  │
//! │                        │                                     │
//! │               ┌────────▼────────┐   ┌────────────────────┐   │
//! │               │  ResponseCache  │   │   ToolRegistry     │   │
//! │               │ (single-flight) │   │                    │   │
//! │               └─────────────────┘   └────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ChatProvider` trait abstracts over heterogeneous upstreams
//! (local Ollama, cloud APIs); the router, agent loop, and cache work
//! exclusively through it. Nothing in this crate performs network I/O.

pub mod agent;
pub mod cache;
pub mod error;
pub mod message;
pub mod provider;
pub mod retry;
pub mod router;
pub mod session;
pub mod tool;

pub use agent::{Agent, AgentConfig, CandidateProvider, TurnOutcome};
pub use cache::ResponseCache;
pub use error::{GatewayError, Result};
pub use message::{Conversation, Message, Role, SidePayload};
pub use provider::ChatProvider;
pub use retry::RetryPolicy;
pub use router::{ProviderCandidate, RouterConfig};
pub use session::{Session, SessionId};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};

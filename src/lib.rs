//! Real-time voice session orchestration.
//!
//! This crate drives a bidirectional audio conversation with a remote
//! realtime model service. It owns the transport handshake (ephemeral token
//! mint, then websocket negotiation), the JSON control protocol on the side
//! channel, and the routing decision for every completed user utterance:
//! answer directly, or escalate to a stronger supervisor model that may call
//! tools before its answer is spoken verbatim by the voice model.
//!
//! The entry point is [`session::SessionOrchestrator`]. Wire it with an
//! [`transport::OpenAiConnector`], a [`supervisor::ChatSupervisor`], and an
//! MCP-backed [`tools::McpToolset`] for the production stack, or with the
//! crate's traits ([`transport::Connector`], [`supervisor::SupervisorClient`],
//! [`tools::ToolProvider`], [`supervisor::EscalationPolicy`]) to substitute
//! any layer.

pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod tools;
pub mod transport;

pub use config::{ApiConfig, SessionConfig, SupervisorMode};
pub use error::SessionError;
pub use session::{ConnectionState, SessionCallbacks, SessionOrchestrator};

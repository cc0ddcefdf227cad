//! Core engine for driving tool-using model conversations.
//!
//! This crate provides the orchestration layer between a streaming language
//! model endpoint and a set of locally executable tools: it drives the
//! agentic loop, validates and confirms tool calls before running them, and
//! extends the local tool set with remote tools discovered over the Model
//! Context Protocol.
//!
//! # Architecture Overview
//!
//! The engine is organized around a few subsystems:
//!
//! - **Session driver**: the bounded turn loop pairing model-requested tool
//!   calls with their results, with quota-triggered model fallback
//! - **Turns**: one streamed model exchange each, translated into events
//! - **Tool system**: the validate → describe → confirm → execute lifecycle,
//!   a collision-resolving registry, and the built-in tools
//! - **Shell execution**: process-group supervised command runs with binary
//!   output detection and prompt cancellation
//! - **Remote discovery**: concurrent, fault-isolated MCP fan-out over stdio
//!   and SSE transports

pub mod config;
pub mod confirmation;
pub mod core_types;
pub mod errors;
pub mod exec;
pub mod llm;
pub mod session;
pub mod tools;
pub mod trace;
pub mod turn;

pub use config::{ApprovalMode, McpCommand, McpServerConfig, SessionConfig};
pub use confirmation::{ConfirmationHandler, ConfirmationOutcome, PendingConfirmation};
pub use core_types::{Message, Part, Role, ToolCallRequest, ToolResult};
pub use errors::CoreError;
pub use llm::{GeminiClient, ModelClient};
pub use session::{Session, SessionEvent, MAX_TURNS};
pub use tools::{Tool, ToolRegistry};
pub use turn::{Turn, TurnEvent};

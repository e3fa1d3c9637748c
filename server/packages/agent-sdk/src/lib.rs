//! Client-side plumbing for the external coding agent.
//!
//! The agent is a black box that can be connected to with a set of
//! [`AgentOptions`], fed a prompt, and streamed typed [`SdkMessage`]s back.
//! Clients differ in how they hand those messages out (see
//! [`QueryResponse`]); [`MessageReader`] folds every shape into a single
//! "next message or end of stream" surface.

pub mod client;
pub mod error;
pub mod message;
pub mod mock;
pub mod options;
pub mod process;

pub use client::{AgentClient, AgentConnector, MessageReader, MessageStream, QueryResponse};
pub use error::SdkError;
pub use message::{
    AssistantMessage, ContentBlock, MessageContent, ResultMessage, SdkMessage, StreamEvent,
    SystemMessage, UserMessage,
};
pub use options::{AgentOptions, PermissionMode};
pub use process::{ClaudeCliConnector, DEFAULT_CONTROL_TIMEOUT};

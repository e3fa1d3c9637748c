//! Multi-user web console for conversational coding-agent sessions.
//!
//! Prompts are submitted over HTTP, executed by a long-lived agent
//! connection per session and streamed back as server-sent events while
//! every message is persisted.

pub mod cli;
pub mod config;
pub mod config_files;
pub mod normalizer;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod service;
pub mod store;

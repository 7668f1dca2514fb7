//! Model-call collaborator for Loresmith.
//!
//! This crate provides:
//! - [`ModelClient`] — the seam the pipeline calls models through
//! - [`OpenRouterClient`] — HTTP chat-completions implementation
//! - [`ScriptedClient`] — canned-response implementation for tests

pub mod client;
pub mod scripted;

pub use client::{ModelClient, OpenRouterClient};
pub use scripted::ScriptedClient;

//! Chat agent orchestration: sandboxed sessions, provider turn loops, SSE
//! streaming and the tool bridge agents call back into.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod events;
pub mod models;
pub mod prompt;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod stream_bridge;
pub mod tokens;
pub mod tools;
pub mod transcript;

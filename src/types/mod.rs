//! Core types for the gateway.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed keys (ScopeKey, ConfigKey, SessionId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for server, bridge, sessions and watch

mod config;
mod errors;
mod ids;

pub use config::{
    BackendConfig, BridgeConfig, Config, ObservabilityConfig, ServerConfig, SessionConfig,
    WatchConfig,
};
pub use errors::{
    Error, Result, RPC_CANCELLED, RPC_INTERNAL, RPC_INVALID_PARAMS, RPC_NOT_FOUND, RPC_TIMEOUT,
};
pub use ids::{ConfigKey, ScopeKey, SessionId};

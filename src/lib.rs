//! # fngate - function tool gateway
//!
//! Exposes backend functions as MCP tool endpoints. Which tools exist, and
//! under which URL, is reconciled continuously from two kinds of watched
//! records:
//! - **credential records** define authorization scopes (`/{ns}/{name}[/{token}]`)
//! - **declaration records** bind tool definitions to a backend function
//!
//! ## Architecture
//!
//! ```text
//!   watch source ──► event pump ──► Reconciler ──► RouteTable (atomic swap)
//!   (manifest)      (per kind)     ├ ScopeRegistry        │
//!                                  └ ToolScope / groups   ▼
//!                                              HTTP gateway (SSE sessions)
//!                                                         │ tools/call
//!                                                         ▼
//!                                              Bridge ──► RpcSubstrate
//!                                                         (bus | http)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod reconcile;
pub mod session;
pub mod types;
pub mod watch;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};

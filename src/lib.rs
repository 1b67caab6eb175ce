//! Agent Relay
//!
//! An Agent Protocol compatible HTTP server whose core is a run-streaming
//! subsystem: every run writes an ordered event log, live consumers fan out
//! through per-run brokers, and late or reconnecting clients get a
//! reconciled replay-plus-live stream with no gaps or duplicates.
//!
//! # Architecture
//!
//! - **API**: Axum-based HTTP server with SSE streaming
//! - **Streaming**: event log + broker + driver + reconciler, owned by a
//!   single coordinator
//! - **Persistence**: pluggable metadata store and event log providers
//!   (in-memory and Postgres)
//!
//! # Modules
//!
//! - [`api`]: HTTP routes, identity resolution, SSE wire conversion
//! - [`streaming`]: the run-streaming core
//! - [`persistence`]: storage traits and providers
//! - [`domain`]: runs, threads, and event types

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod server;
pub mod streaming;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::streaming::StreamCoordinator;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The streaming core: run creation, stream reconciliation, lifecycle.
    pub coordinator: Arc<StreamCoordinator>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}

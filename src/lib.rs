//! # OrionKV
//!
//! An in-memory key-value server speaking a line/array text protocol, with:
//! - Three value families: scalar strings, field maps, score-ordered sets
//! - Per-key expiry (lazy on access plus periodic sampling)
//! - An append-only command log with configurable fsync policy and
//!   background rewrite
//! - Text snapshots for cold start and replica bootstrap
//! - Primary → replica command streaming with resumable offsets
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Reactor (one thread)                     │
//! │    nonblocking accept / per-connection buffers / tick        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ parsed frames
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Dispatch                              │
//! │        apply → log enqueue → replica broadcast               │
//! │              (one engine acquisition)                        │
//! └───────┬──────────────────┬──────────────────┬───────────────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//!  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!  │   Engine    │    │  Append log │    │  Replicas   │
//!  │  (Mutex)    │    │ (writer     │    │ (outbound   │
//!  │             │    │  thread)    │    │  buffers)   │
//!  └─────────────┘    └─────────────┘    └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod engine;
pub mod network;
pub mod protocol;
pub mod replica;
pub mod snapshot;
pub mod wal;
pub mod zset;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use engine::Engine;
pub use error::{OrionError, Result};
pub use network::Server;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of OrionKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! WebSocket fan-out server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `manager` | One hub + bridge per shard, username → shard assignment |
//! | `hub` | Single-writer actor owning a shard's membership and delivery |
//! | `bridge` | Bus subscription → hub mailbox |
//! | `client` | Per-connection receive/send pumps and idempotent teardown |
//! | `history` | Replay of the bounded history into a new client's queue |
//! | `server` | Axum router, upgrade handling, startup |
//!
//! ## Data Flow
//!
//! socket → `client` receive pump → broker (history + publish) → every
//! process's `bridge` → `hub` → member queues → `client` send pump → socket.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod hub;
pub mod manager;
pub mod server;

pub use config::{HubConfig, ServerConfig};
pub use error::ServerError;
pub use manager::ConnectionManager;
pub use server::{build_router, start, AppState, ServerHandle};

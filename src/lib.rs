//! Warden - session orchestration core
//!
//! Keeps many independent accounts signed in to a remote service
//! concurrently, under a global request-rate ceiling and a bounded number
//! of simultaneous connection attempts, surviving process restarts.
//!
//! ## Components
//!
//! - **Limits**: sliding-window rate limiter, FIFO concurrency gate,
//!   per-session exponential backoff
//! - **Crypto**: authenticated encryption for persisted credentials
//! - **State**: atomic snapshots, rotating backups, periodic autosave
//! - **Registry**: the orchestrator driving every session's lifecycle
//! - **Client**: the trait boundary to the external service client

pub mod accounts;
pub mod client;
pub mod config;
pub mod crypto;
pub mod limits;
pub mod registry;
pub mod settings;
pub mod state;
pub mod types;

pub use config::Args;
pub use registry::{RegistryConfig, SessionRegistry};
pub use types::{Result, WardenError};

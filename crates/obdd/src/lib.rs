//! obdd - OBD-II diagnostic sessions
//!
//! Ties adapter discovery, link sessions, acquisition and analysis together
//! behind [`SessionOrchestrator`], which enforces one active session per
//! vehicle and hands finished sessions to a [`SessionStore`].

pub mod config;
pub mod orchestrator;
pub mod storage;

pub use config::AppConfig;
pub use orchestrator::{OrchestratorBuilder, SessionOrchestrator};
pub use storage::{create_store, JsonSessionStore, MemorySessionStore, SessionStore, StorageError};

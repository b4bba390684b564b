//! obd-core - Core types for OBD diagnostic sessions
//!
//! This crate holds the value objects passed between the link, analysis and
//! orchestration layers, the shared error taxonomy, progress events, and the
//! read-only trouble-code reference catalog.

pub mod catalog;
pub mod error;
pub mod event;
pub mod models;

pub use catalog::{CatalogError, ReferenceCatalog, ReferenceEntry, ResolvedCode};
pub use error::{AcquisitionError, AiProviderError, ConnectionError, DiagError, DiagResult};
pub use event::ProgressEvent;
pub use models::*;

//! Session registry and transcript persistence.
//!
//! A session is created from an immutable mount plan and lives until
//! explicitly closed or the process exits. This crate owns its on-disk
//! metadata and append-only transcript; it knows nothing about providers,
//! tools, or the orchestrator loop that drives a session's turns.

pub mod store;
pub mod transcript;

pub use store::{Session, SessionStatus, SessionStore};
pub use transcript::{TranscriptLine, TranscriptWriter};

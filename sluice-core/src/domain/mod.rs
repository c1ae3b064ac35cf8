//! Core domain types
//!
//! These types are persisted by the orchestrator's run registry and returned
//! verbatim by its query surface, so the client and CLI share them too.

pub mod error;
pub mod run;
pub mod task;

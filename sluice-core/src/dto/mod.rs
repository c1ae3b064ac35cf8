//! Data Transfer Objects
//!
//! Request and response bodies exchanged between the orchestrator's HTTP
//! surface and its callers (client library, CLI, webhook senders).

pub mod run;
pub mod webhook;

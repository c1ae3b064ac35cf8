//! Sluice Core
//!
//! Core types and abstractions for the Sluice build-and-deploy orchestrator.
//!
//! This crate contains:
//! - Domain types: Runs, TaskRuns and the failure taxonomy
//! - DTOs: Request/response bodies shared by orchestrator, client and CLI

pub mod domain;
pub mod dto;

//! Tugboat Core
//!
//! Core types and abstractions for the Tugboat deployment pipeline.
//!
//! This crate contains:
//! - Domain types: pipeline state, retry policies, deployment specs, reports
//! - Errors: the per-stage error taxonomy shared by the runner

pub mod domain;
pub mod error;

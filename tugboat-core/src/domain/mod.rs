//! Core domain types
//!
//! These structures are threaded through every pipeline stage. They are
//! created at the start of a run and discarded at its end; nothing here is
//! persisted across runs.

pub mod deployment;
pub mod diagnostics;
pub mod policy;
pub mod result;
pub mod stage;
pub mod state;

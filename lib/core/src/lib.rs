//! Core identifiers and error handling for flowdeck.
//!
//! This crate provides the strongly-typed IDs shared by every other crate
//! and the rootcause-based `Result` alias.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    DefinitionId, FlowRunId, ParseIdError, ProjectId, RunLogId, SnapshotId, TenantId, ThreadId,
    UserId,
};

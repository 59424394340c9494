//! Shared domain types for Stitchflow.
//!
//! This crate contains the core domain types used across the Stitchflow
//! platform: pipeline definitions, run/step execution records, the
//! completion-callback wire format, retrieval collaborator types, and the
//! closed error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod callback;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod retrieval;
pub mod run;

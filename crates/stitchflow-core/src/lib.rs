//! Pipeline compilation, execution, and reconciliation for Stitchflow.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements. It depends only on
//! `stitchflow-types` -- never on `stitchflow-infra` or any database/IO
//! crate.
//!
//! Layout mirrors the data flow: definitions compile through [`graph`],
//! cross-node data flows through [`resolver`], node kinds dispatch through
//! [`node`], runs execute in [`engine`], and external completion callbacks
//! converge run state through [`reconcile`].

pub mod engine;
pub mod graph;
pub mod node;
pub mod reconcile;
pub mod repository;
pub mod resolver;

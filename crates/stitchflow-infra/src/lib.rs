//! Infrastructure implementations for Stitchflow.
//!
//! Concrete adapters behind the core's ports: SQLite persistence for runs
//! and steps, the HTTP provider gateway client, the lexical knowledge
//! retriever, and configuration loading.

pub mod config;
pub mod provider;
pub mod retrieval;
pub mod sqlite;

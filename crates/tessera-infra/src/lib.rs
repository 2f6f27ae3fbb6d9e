//! Infrastructure layer for Tessera.
//!
//! Contains implementations of the ports defined in `tessera-core`: the SQLite
//! execution store, the in-process action executor, the YAML workflow catalog,
//! plus configuration loading and a runtime that wires them together.

pub mod catalog;
pub mod config;
pub mod executor;
pub mod runtime;
pub mod sqlite;

//! Workflow execution engine and storage trait definitions for Tessera.
//!
//! This crate defines the "ports" (storage, expression evaluation, action
//! execution, workflow catalog) and the engine that drives them. It depends
//! only on `tessera-types` -- never on `tessera-infra` or any database crate.
//! An in-memory store is included for tests and embedded use.

pub mod event;
pub mod repository;
pub mod workflow;

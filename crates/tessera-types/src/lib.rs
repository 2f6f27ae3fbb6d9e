//! Shared domain types for Tessera.
//!
//! This crate contains the value objects every other crate agrees on:
//! workflow and task specifications, execution records and their states,
//! action results, delayed calls, engine events, configuration, and the
//! repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod delayed_call;
pub mod error;
pub mod event;
pub mod execution;
pub mod result;
pub mod spec;
pub mod state;

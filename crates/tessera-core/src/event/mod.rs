//! Event bus for engine state changes.
//!
//! Provides an `EventBus` that distributes `EngineEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel. The engine publishes
//! only after the transaction that produced an event has committed.

pub mod bus;

pub use bus::EventBus;

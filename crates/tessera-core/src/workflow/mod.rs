//! Workflow engine core: controllers, policies, data flow and the dispatcher.
//!
//! - `expression` -- evaluator port and the JEXL implementation
//! - `context` -- layered read-only context views and publishing
//! - `definition` -- structural validation of workflow specs
//! - `dag` -- transition and requires graphs (petgraph)
//! - `runtime` -- typed access to a task's runtime bookkeeping
//! - `policy` -- wait-before/after, pause, concurrency, retry and timeout
//! - `with_items` -- fan-out of one task into indexed action executions
//! - `controller` -- direct and reverse task-graph controllers
//! - `executor` -- action executor port and the completion channel
//! - `catalog` -- workflow definitions by name
//! - `engine` -- the command dispatcher driving everything above
//! - `scheduler` -- delayed-call poller

pub mod catalog;
pub mod context;
pub mod controller;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod executor;
pub mod expression;
pub mod policy;
pub mod runtime;
pub mod scheduler;
pub mod with_items;

pub use engine::{Engine, EngineError, ErrorKind};

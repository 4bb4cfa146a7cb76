//! # taskproc
//!
//! Durable task queue shared by any number of worker processes.
//!
//! Producers enqueue tasks (and recurring definitions) into a store; each
//! worker runs a [`engine::Dispatcher`] that atomically claims batches,
//! executes the named actions from an [`registry::ActionRegistry`] and
//! records the outcome, retrying with backoff until a task succeeds or is
//! abandoned. A [`engine::RecurrenceExpander`] turns due recurring
//! definitions into tasks without double firing.
//!
//! The store is injected: [`db::Db`] on Postgres, [`store::MemoryStore`] in
//! process.

pub mod actions;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod registry;
pub mod store;
pub mod telemetry;

//! Session execution orchestrator
//!
//! Serializes coding-agent executions one session at a time. Each
//! `(owner, session)` pair is served by a single SessionActor that owns a
//! private SQLite store holding the command queue, leases and the execution
//! state machine.

pub mod actors;
pub mod api;
pub mod config;
pub mod registry;
pub mod runner;
pub mod store;

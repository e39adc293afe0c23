//! Persistent state for tasks, tickets, artifacts, and interventions.
//!
//! The store is the single source of truth; every contended mutation is a
//! single conditional UPDATE whose WHERE clause encodes the expected prior
//! state. Events observe the store, never the other way around.

pub mod db;
pub mod models;

pub use db::{DbHandle, EngineDb};

//! Core domain types for the lanekeeper CI coordinator.
//!
//! This crate contains:
//! - Entity identifiers
//! - Work and dependency state enumerations
//! - Lane, host, revision, and work entities
//! - Commit filter expressions
//! - Progress log sinks
//! - The shared error type

pub mod dependency;
pub mod error;
pub mod filter;
pub mod id;
pub mod lane;
pub mod progress;
pub mod state;
pub mod work;

pub use error::{Error, Result};
pub use id::EntityId;
pub use state::{DependencyCondition, WorkState};

//! HTTP trigger surface for the lanekeeper scheduler.
//!
//! Thin by design: endpoints validate parameters, enqueue scheduler updates,
//! and optionally stream the scheduling log back as the response body.

pub mod error;
pub mod routes;
pub mod state;
pub mod stream;

pub use state::AppState;

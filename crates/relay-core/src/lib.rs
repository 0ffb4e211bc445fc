//! Relay CI Core
//!
//! Core domain types, traits, and error handling for Relay CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod error;
pub mod hooks;
pub mod ids;
pub mod interpolation;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;

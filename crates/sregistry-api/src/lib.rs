//! sregistry API - HTTP wire models for the naming registry
//!
//! This crate provides:
//! - Common constants and the login response model
//! - Naming models (instances, instance lists, beats, service lists)
//! - Input validation utilities

pub mod model;
pub mod naming;
pub mod validation;

// Re-export commonly used types
pub use model::*;
pub use validation::*;

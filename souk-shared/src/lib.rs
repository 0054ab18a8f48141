//! Shared models and configuration for the Souk realtime layer.

/// Client configuration.
pub mod config;
/// Wire and domain models.
pub mod models;

//! # Configuration
//!
//! Client configuration: backend location, logging, and the realtime timing
//! settings shared by every transport.

/// Client configuration and realtime timing settings.
pub mod client;

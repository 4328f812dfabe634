//! # Utilities Module
//!
//! General-purpose helpers shared across the gateway binaries.

/// Timestamp formatting and log-redaction helpers.
pub mod time;

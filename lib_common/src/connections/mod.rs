//! # Connections Module
//!
//! This module handles persistent connections to external services,
//! currently the Redis caching and streaming layer.

/// Module for Redis cache operations and connection handling.
pub mod cache_redis;

//! Two-tier caching of database query results with table-driven
//! invalidation.
//!
//! The entry point is [`cache::QueryCache`]; [`infra::redis::RedisTier`]
//! provides the shared remote tier.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;

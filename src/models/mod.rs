//! Core data models for the bucket store.
//!
//! Buckets and files map to metadata tables via `sqlx::FromRow` and serialize
//! as JSON via `serde`. Identity is supplied by the authentication gateway.

pub mod bucket;
pub mod file;
pub mod identity;

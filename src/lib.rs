//! marketing-sync - Resilient ingestion of marketing data from a rate-limited API
//!
//! This crate fetches campaigns, flows, forms and segments from an external
//! JSON:API service, stores them in a local SQLite database with per-entity
//! sync bookkeeping, and serves cached reads over the stored data.

pub mod cache;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod sync;
pub mod telemetry;

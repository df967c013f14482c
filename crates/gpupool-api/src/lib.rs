//! gpupool-api: REST API server for gpupool
//!
//! This crate provides the REST API for interacting with a gpupool cluster:
//! - Allocation, release and migration
//! - Dry-run placement
//! - Device listing and cluster topology changes
//! - Metrics and resource status
//! - Monitor health and a server-sent event stream of monitor events

pub mod rest;

pub use rest::create_router;

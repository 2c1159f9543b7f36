//! # wirerpc-core
//!
//! This crate provides the core utilities for [`wirerpc`](https://docs.rs/wirerpc).
//! It includes the error taxonomy, configuration, the async I/O and transport traits,
//! object pools and the metrics sink shared by the other crates in the workspace.

mod config;
pub use config::*;
pub mod error;
pub mod io;
pub mod metrics;
pub mod pool;

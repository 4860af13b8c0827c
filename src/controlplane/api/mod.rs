//! API Module
//!
//! REST surface over the orchestrator.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;

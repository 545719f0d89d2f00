//! LP-SENTINEL — risk-management control loop for liquidity-provisioning agents
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod engine;
pub mod storage;
pub mod dashboard;

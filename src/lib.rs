//! Lane Engine: martingale recovery lanes for binary-options accounts.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod strategy;
pub mod engine;
pub mod storage;
pub mod dashboard;

//! TRENDWARDEN: daily single-asset trend-following execution daemon
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod strategy;
pub mod brokers;
pub mod data;
pub mod storage;
pub mod engine;
pub mod dashboard;

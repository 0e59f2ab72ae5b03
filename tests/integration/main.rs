//! Integration tests for TRENDWARDEN.

mod mock_broker;
mod runtime;

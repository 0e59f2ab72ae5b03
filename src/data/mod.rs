//! Historical price providers.
//!
//! Defines the `DataSource` trait and the shipped implementations:
//! - `CsvDataSource`: daily OHLCV exports on local disk
//! - `InMemoryDataSource`: fixed series (simulation quotes, demos)

pub mod csv_file;
pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::types::{EngineResult, PriceSeries};

pub use csv_file::CsvDataSource;
pub use memory::InMemoryDataSource;

/// Abstraction over daily price history.
///
/// Implementors return an ascending daily series for `symbol` within
/// `[start, end]`, or `EngineError::DataUnavailable` when nothing matches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<PriceSeries>;
}

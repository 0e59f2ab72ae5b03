//! In-memory price source.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::RwLock;

use super::DataSource;
use crate::types::{EngineError, EngineResult, PriceSeries};

/// Serves pre-loaded series keyed by upper-cased symbol.
///
/// Series can be replaced while the engine runs, which is how demos and
/// tests move the market between decision cycles.
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    series: RwLock<HashMap<String, PriceSeries>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(series: PriceSeries) -> Self {
        let source = Self::new();
        source.insert(series);
        source
    }

    /// Insert or replace the series for `series.symbol`.
    pub fn insert(&self, series: PriceSeries) {
        let key = series.symbol.trim().to_uppercase();
        if let Ok(mut map) = self.series.write() {
            map.insert(key, series);
        }
    }
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<PriceSeries> {
        let key = symbol.trim().to_uppercase();
        let map = self
            .series
            .read()
            .map_err(|_| EngineError::DataUnavailable("price store lock poisoned".into()))?;

        let series = map
            .get(&key)
            .map(|s| s.between(start, end))
            .unwrap_or_default();

        if series.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "No data for {symbol} between {start} and {end}"
            )));
        }
        Ok(series)
    }
}

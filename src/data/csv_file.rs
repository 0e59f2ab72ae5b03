//! Daily OHLCV from CSV exports on disk.
//!
//! Expects one file per symbol, `<dir>/<SYMBOL>.csv`, with the usual
//! export header: `Date,Open,High,Low,Close,Adj Close,Volume`.
//! `Adj Close` may be missing; `Close` is used in its place.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::DataSource;
use crate::types::{EngineError, EngineResult, PriceBar, PriceSeries};

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Open", default, deserialize_with = "csv::invalid_option")]
    open: Option<f64>,
    #[serde(rename = "High", default, deserialize_with = "csv::invalid_option")]
    high: Option<f64>,
    #[serde(rename = "Low", default, deserialize_with = "csv::invalid_option")]
    low: Option<f64>,
    #[serde(rename = "Close", default, deserialize_with = "csv::invalid_option")]
    close: Option<f64>,
    #[serde(rename = "Adj Close", default, deserialize_with = "csv::invalid_option")]
    adj_close: Option<f64>,
    #[serde(rename = "Volume", default, deserialize_with = "csv::invalid_option")]
    volume: Option<f64>,
}

impl CsvRow {
    /// Rows with a missing or non-finite price are dropped.
    fn into_bar(self) -> Option<PriceBar> {
        let close = self.close.filter(|c| c.is_finite())?;
        let adj_close = self.adj_close.filter(|c| c.is_finite()).unwrap_or(close);
        Some(PriceBar {
            date: self.date,
            open: self.open.unwrap_or(close),
            high: self.high.unwrap_or(close),
            low: self.low.unwrap_or(close),
            close,
            adj_close,
            volume: self.volume.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CsvDataSource {
    dir: PathBuf,
}

impl CsvDataSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", symbol.trim().to_uppercase()))
    }
}

fn read_bars(path: &Path) -> EngineResult<Vec<PriceBar>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| EngineError::DataUnavailable(format!("{}: {e}", path.display())))?;

    let mut bars = Vec::new();
    let mut skipped = 0usize;
    for row in reader.deserialize::<CsvRow>() {
        match row {
            Ok(row) => match row.into_bar() {
                Some(bar) => bars.push(bar),
                None => skipped += 1,
            },
            Err(e) => {
                return Err(EngineError::MalformedResponse {
                    source_name: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
    if skipped > 0 {
        debug!(path = %path.display(), skipped, "Dropped rows without a usable price");
    }
    Ok(bars)
}

#[async_trait]
impl DataSource for CsvDataSource {
    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<PriceSeries> {
        let path = self.path_for(symbol);
        let read_path = path.clone();
        let bars = tokio::task::spawn_blocking(move || read_bars(&read_path))
            .await
            .map_err(|e| EngineError::DataUnavailable(format!("CSV reader task failed: {e}")))??;

        let series = PriceSeries::new(symbol.trim().to_uppercase(), bars).between(start, end);
        if series.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "No data returned for {symbol} between {start} and {end}"
            )));
        }

        info!(
            symbol,
            path = %path.display(),
            bars = series.len(),
            "Loaded daily bars"
        );
        Ok(series)
    }
}

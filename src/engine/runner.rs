//! One end-to-end decision cycle.
//!
//! FETCH_DATA → COMPUTE_WEIGHT → FETCH_ACCOUNT → SIZE_ORDER →
//! SUBMIT_ORDER (only when the delta is non-zero) → RECORD.
//! The first failing phase aborts the rest and is reported in `CycleError`.

use chrono::{Duration, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::brokers::BrokerClient;
use crate::data::DataSource;
use crate::strategy::{PositionSizer, SignalEngine};
use crate::types::{Decision, DecisionResult, EngineError, EngineResult, PriceSeries};

/// Default calendar-day window requested from the data source. Enough for
/// the slow EMA to warm up on trading days.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    FetchData,
    ComputeWeight,
    FetchAccount,
    SizeOrder,
    SubmitOrder,
    Record,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::FetchData => "FETCH_DATA",
            Phase::ComputeWeight => "COMPUTE_WEIGHT",
            Phase::FetchAccount => "FETCH_ACCOUNT",
            Phase::SizeOrder => "SIZE_ORDER",
            Phase::SubmitOrder => "SUBMIT_ORDER",
            Phase::Record => "RECORD",
        };
        f.write_str(name)
    }
}

/// A decision cycle aborted in `phase`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{phase} failed: {source}")]
pub struct CycleError {
    pub phase: Phase,
    pub source: EngineError,
}

trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> Result<T, CycleError>;
}

impl<T> InPhase<T> for EngineResult<T> {
    fn in_phase(self, phase: Phase) -> Result<T, CycleError> {
        self.map_err(|source| CycleError { phase, source })
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Traded symbol.
    pub symbol: String,
    /// Symbol whose history drives the signal. Defaults to `symbol`.
    pub data_symbol: Option<String>,
    pub lookback_days: i64,
}

impl RunnerConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            data_symbol: None,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }

    fn data_symbol(&self) -> &str {
        self.data_symbol.as_deref().unwrap_or(&self.symbol)
    }
}

pub struct LiveDecisionRunner {
    config: RunnerConfig,
    signal: SignalEngine,
    sizer: PositionSizer,
    last_decision: RwLock<Option<Decision>>,
}

impl LiveDecisionRunner {
    pub fn new(config: RunnerConfig, signal: SignalEngine, sizer: PositionSizer) -> Self {
        Self {
            config,
            signal,
            sizer,
            last_decision: RwLock::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// The most recently recorded decision.
    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision.read().ok().and_then(|d| d.clone())
    }

    /// Run one decision cycle against `broker` using history from `data`.
    pub async fn run_once(
        &self,
        broker: &dyn BrokerClient,
        data: &dyn DataSource,
    ) -> Result<DecisionResult, CycleError> {
        let symbol = self.config.symbol.as_str();
        info!(symbol, broker = broker.name(), "Starting decision cycle");

        // 1. History
        let series = self.fetch_history(data).await.in_phase(Phase::FetchData)?;

        // 2. Signal
        let snapshot = self.signal.latest(&series).in_phase(Phase::ComputeWeight)?;
        let target_weight = snapshot.target.weight;
        info!(
            symbol,
            weight = target_weight,
            signal = %snapshot.signal_state,
            trend_up = snapshot.trend_up,
            realized_vol = ?snapshot.realized_vol,
            "Target weight computed"
        );

        // 3. Account
        broker.connect().await.in_phase(Phase::FetchAccount)?;
        let account = broker.get_account_info().await.in_phase(Phase::FetchAccount)?;
        account.validate(broker.name()).in_phase(Phase::FetchAccount)?;
        let positions = broker.get_positions().await.in_phase(Phase::FetchAccount)?;
        let current_qty = positions
            .iter()
            .filter(|p| p.matches(symbol))
            .map(|p| p.quantity)
            .sum::<Decimal>();
        if current_qty.is_sign_negative() && !current_qty.is_zero() {
            return Err(CycleError {
                phase: Phase::FetchAccount,
                source: EngineError::MalformedResponse {
                    source_name: broker.name().to_string(),
                    message: format!("negative position {current_qty} in {symbol}"),
                },
            });
        }
        info!(%account, current_qty = %current_qty, "Account fetched");

        // 4. Size on the same adjusted basis the signal uses
        let last_price = series
            .last()
            .and_then(|b| {
                [b.adj_close, b.close]
                    .into_iter()
                    .find(|p| p.is_finite() && *p > 0.0)
            })
            .unwrap_or(snapshot.last_price);
        let price = Decimal::from_f64(last_price).unwrap_or(Decimal::ZERO);
        let sized = self
            .sizer
            .size(account.equity, account.cash, price, target_weight, current_qty);
        if sized.data_fault {
            return Err(CycleError {
                phase: Phase::SizeOrder,
                source: EngineError::DataUnavailable(format!("unusable price {last_price} for {symbol}")),
            });
        }

        // 5. Order
        let receipt = match sized.order(symbol) {
            Some(order) => {
                info!(%order, "Submitting market order");
                let receipt = broker
                    .market_order(&order.symbol, order.side, order.quantity)
                    .await
                    .in_phase(Phase::SubmitOrder)?;
                info!(%receipt, "Order filled");
                Some(receipt)
            }
            None => None,
        };

        // 6. Record
        let message = match &receipt {
            Some(r) => format!("{} {} {} @ {:.2}", r.side, r.quantity, r.symbol, r.fill_price),
            None => format!("No trade: holding {} {symbol}", sized.current_qty),
        };
        let decision_time = Utc::now();
        let decision = Decision {
            symbol: symbol.to_string(),
            target_weight,
            signal_state: snapshot.signal_state,
            last_price,
            message: message.clone(),
            timestamp: decision_time,
        };
        match self.last_decision.write() {
            Ok(mut slot) => *slot = Some(decision),
            Err(_) => {
                return Err(CycleError {
                    phase: Phase::Record,
                    source: EngineError::InvalidState("decision slot lock poisoned".into()),
                })
            }
        }

        let result = DecisionResult {
            message,
            symbol: symbol.to_string(),
            signal_state: snapshot.signal_state,
            target_weight,
            last_price,
            target_qty: sized.target_qty,
            current_qty,
            delta: sized.delta,
            order: receipt,
            cash: account.cash,
            equity: account.equity,
            decision_time,
        };
        info!(result = %result, "Decision cycle complete");
        Ok(result)
    }

    async fn fetch_history(&self, data: &dyn DataSource) -> EngineResult<PriceSeries> {
        let end = Utc::now().date_naive();
        let start = end - Duration::days(self.config.lookback_days.max(1));
        let data_symbol = self.config.data_symbol();

        let series = data.daily_bars(data_symbol, start, end).await?;
        if series.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "No data returned for {data_symbol} between {start} and {end}"
            )));
        }
        if let Some(last) = series.last() {
            if (end - last.date).num_days() > 5 {
                warn!(symbol = data_symbol, last_bar = %last.date, "Price history looks stale");
            }
        }
        Ok(series)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

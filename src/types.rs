//! Shared types for the TRENDWARDEN engine.
//!
//! These types form the data model used across all modules.
//! Strategy, broker, storage and engine modules depend on them
//! without depending on each other.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

/// One daily bar as supplied by a `DataSource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Split/dividend adjusted close. Equal to `close` when the source has none.
    pub adj_close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// A bar where every price field is `price`. Handy for synthetic series.
    pub fn flat(date: NaiveDate, price: f64) -> Self {
        Self {
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            adj_close: price,
            volume: 0.0,
        }
    }
}

/// Ascending daily history for one symbol. Gaps (weekends, holidays) are fine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    bars: Vec<PriceBar>,
}

impl PriceSeries {
    /// Build a series, sorting by date. A repeated date keeps the later bar.
    pub fn new(symbol: impl Into<String>, mut bars: Vec<PriceBar>) -> Self {
        bars.sort_by_key(|b| b.date);
        let mut deduped: Vec<PriceBar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => deduped.push(bar),
            }
        }
        Self {
            symbol: symbol.into(),
            bars: deduped,
        }
    }

    /// Convenience constructor from `(date, price)` pairs.
    pub fn from_closes(symbol: impl Into<String>, closes: &[(NaiveDate, f64)]) -> Self {
        let bars = closes.iter().map(|(d, p)| PriceBar::flat(*d, *p)).collect();
        Self::new(symbol, bars)
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&PriceBar> {
        self.bars.last()
    }

    /// Restrict to bars within `[start, end]` (inclusive).
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> PriceSeries {
        PriceSeries {
            symbol: self.symbol.clone(),
            bars: self
                .bars
                .iter()
                .filter(|b| b.date >= start && b.date <= end)
                .cloned()
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Desired exposure for a symbol on a date, always within [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetWeight {
    pub date: NaiveDate,
    pub symbol: String,
    pub weight: f64,
}

/// Coarse signal classification shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalState {
    Long,
    Flat,
}

impl SignalState {
    /// Weights at or below this are reported as FLAT.
    pub const LONG_THRESHOLD: f64 = 0.001;

    pub fn from_weight(weight: f64) -> Self {
        if weight > Self::LONG_THRESHOLD {
            SignalState::Long
        } else {
            SignalState::Flat
        }
    }
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalState::Long => write!(f, "LONG"),
            SignalState::Flat => write!(f, "FLAT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Account, positions, orders
// ---------------------------------------------------------------------------

/// Validated account balances as reported by a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub currency: String,
}

impl AccountSnapshot {
    /// Reject negative balances instead of silently clamping them.
    pub fn validate(&self, source: &str) -> EngineResult<()> {
        for (field, value) in [
            ("equity", self.equity),
            ("cash", self.cash),
            ("buying_power", self.buying_power),
        ] {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(EngineError::MalformedResponse {
                    source_name: source.to_string(),
                    message: format!("{field} is negative ({value})"),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for AccountSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "equity={:.2} cash={:.2} buying_power={:.2} {}",
            self.equity, self.cash, self.buying_power, self.currency,
        )
    }
}

/// An open holding. Quantity is never negative in this system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

impl Position {
    pub fn matches(&self, symbol: &str) -> bool {
        self.symbol.trim().eq_ignore_ascii_case(symbol.trim())
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A market order request. Quantity is whole shares and always > 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.side, self.quantity, self.symbol)
    }
}

/// Receipt returned after a broker accepts an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub fill_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for TradeReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} @ {:.2} [{}]",
            self.side, self.quantity, self.symbol, self.fill_price, self.order_id,
        )
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// The recorded outcome of one decision cycle. Never mutated; the next
/// cycle supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub target_weight: f64,
    pub signal_state: SignalState,
    pub last_price: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything a caller learns from a completed `run_once`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub message: String,
    pub symbol: String,
    pub signal_state: SignalState,
    pub target_weight: f64,
    pub last_price: f64,
    pub target_qty: i64,
    pub current_qty: Decimal,
    pub delta: i64,
    pub order: Option<TradeReceipt>,
    pub cash: Decimal,
    pub equity: Decimal,
    pub decision_time: DateTime<Utc>,
}

impl fmt::Display for DecisionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} w={:.3} px={:.2} target={} current={} delta={:+} | {}",
            self.symbol,
            self.signal_state,
            self.target_weight,
            self.last_price,
            self.target_qty,
            self.current_qty,
            self.delta,
            self.message,
        )
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Runtime state machine: only two states exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineMode {
    Stopped,
    Active,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::Stopped => write!(f, "STOPPED"),
            EngineMode::Active => write!(f, "ACTIVE"),
        }
    }
}

/// Durable engine state, owned by the runtime controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineState {
    pub engine_active: bool,
    pub in_position: bool,
    pub symbol: String,
    pub last_target_weight: f64,
    pub last_run_date: Option<NaiveDate>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub kill_switch_triggered: bool,
    pub kill_switch_reason: String,
    /// Next scheduled fire time, in local wall-clock time.
    pub next_run_local: Option<NaiveDateTime>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            engine_active: false,
            in_position: false,
            symbol: "QQQ".to_string(),
            last_target_weight: 0.0,
            last_run_date: None,
            last_attempt: None,
            kill_switch_triggered: false,
            kill_switch_reason: String::new(),
            next_run_local: None,
        }
    }
}

impl EngineState {
    pub fn for_symbol(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Self::default()
        }
    }

    pub fn mode(&self) -> EngineMode {
        if self.engine_active {
            EngineMode::Active
        } else {
            EngineMode::Stopped
        }
    }
}

/// One dated record of total account value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub equity: Decimal,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for TRENDWARDEN.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Order rejected: {0}")]
    Order(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Malformed response from {source_name}: {message}")]
    MalformedResponse { source_name: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

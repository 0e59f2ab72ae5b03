//! Simulated brokerage account.
//!
//! In-memory paper account for demos and unattended dry runs. Market
//! orders fill at the latest close from a quote `DataSource` (or the last
//! mark set by hand), and the account enforces cash-only trading.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::{BrokerClient, BrokerConfig, BrokerFactory, BrokerMode};
use crate::data::DataSource;
use crate::types::{AccountSnapshot, EngineError, EngineResult, Position, Side, TradeReceipt};

const BROKER_NAME: &str = "sim";

/// Calendar days searched backwards for a quote.
const QUOTE_LOOKBACK_DAYS: i64 = 14;

/// Fills kept in the ledger; older ones are dropped.
pub const MAX_TRADE_LOG: usize = 1000;

#[derive(Debug, Clone)]
struct Holding {
    quantity: Decimal,
    avg_price: Decimal,
}

#[derive(Debug, Default)]
struct Ledger {
    cash: Decimal,
    holdings: HashMap<String, Holding>,
    marks: HashMap<String, Decimal>,
    trades: Vec<TradeReceipt>,
}

pub struct SimBroker {
    account_id: String,
    currency: String,
    quotes: Option<Arc<dyn DataSource>>,
    connected: AtomicBool,
    ledger: Mutex<Ledger>,
}

impl SimBroker {
    pub fn new(account_id: impl Into<String>, starting_cash: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            currency: "USD".to_string(),
            quotes: None,
            connected: AtomicBool::new(false),
            ledger: Mutex::new(Ledger {
                cash: starting_cash.max(Decimal::ZERO),
                ..Ledger::default()
            }),
        }
    }

    /// Fill and mark at the latest close from `quotes`.
    pub fn with_quotes(mut self, quotes: Arc<dyn DataSource>) -> Self {
        self.quotes = Some(quotes);
        self
    }

    /// Set the mark used for fills and valuation when no quote is available.
    pub fn set_mark(&self, symbol: &str, price: Decimal) -> EngineResult<()> {
        self.ledger()?.marks.insert(key(symbol), price);
        Ok(())
    }

    fn ledger(&self) -> EngineResult<MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|_| EngineError::InvalidState("sim ledger lock poisoned".into()))
    }

    fn ensure_connected(&self) -> EngineResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Connection("Sim broker is not connected".into()))
        }
    }

    /// Latest close from the quote source, falling back to the stored mark.
    async fn quote(&self, symbol: &str) -> EngineResult<Decimal> {
        if let Some(quotes) = &self.quotes {
            let today = Utc::now().date_naive();
            let start = today - Duration::days(QUOTE_LOOKBACK_DAYS);
            match quotes.daily_bars(symbol, start, today).await {
                Ok(series) => {
                    if let Some(price) = series
                        .last()
                        .and_then(|bar| Decimal::from_f64(bar.close))
                        .filter(|p| *p > Decimal::ZERO)
                    {
                        self.ledger()?.marks.insert(key(symbol), price);
                        return Ok(price);
                    }
                }
                Err(e) => debug!(symbol, error = %e, "No quote, using stored mark"),
            }
        }

        self.ledger()?
            .marks
            .get(&key(symbol))
            .copied()
            .ok_or_else(|| EngineError::Order(format!("No price available for {symbol}")))
    }
}

fn key(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

#[async_trait]
impl BrokerClient for SimBroker {
    async fn connect(&self) -> EngineResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!(account = %self.account_id, "Sim broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_account_info(&self) -> EngineResult<AccountSnapshot> {
        self.ensure_connected()?;
        let ledger = self.ledger()?;
        let market_value: Decimal = ledger
            .holdings
            .iter()
            .map(|(sym, h)| h.quantity * ledger.marks.get(sym).copied().unwrap_or(h.avg_price))
            .sum();

        Ok(AccountSnapshot {
            equity: ledger.cash + market_value,
            cash: ledger.cash,
            buying_power: ledger.cash,
            currency: self.currency.clone(),
        })
    }

    async fn get_positions(&self) -> EngineResult<Vec<Position>> {
        self.ensure_connected()?;
        let ledger = self.ledger()?;
        let mut positions: Vec<Position> = ledger
            .holdings
            .iter()
            .map(|(sym, h)| Position {
                symbol: sym.clone(),
                quantity: h.quantity,
                avg_price: h.avg_price,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_trades(&self) -> EngineResult<Vec<TradeReceipt>> {
        self.ensure_connected()?;
        Ok(self.ledger()?.trades.clone())
    }

    async fn market_order(&self, symbol: &str, side: Side, quantity: u64) -> EngineResult<TradeReceipt> {
        self.ensure_connected()?;
        if quantity == 0 {
            return Err(EngineError::Order("Quantity must be positive".into()));
        }

        let price = self.quote(symbol).await?;
        let qty = Decimal::from(quantity);
        let notional = price * qty;
        let sym = key(symbol);

        let mut ledger = self.ledger()?;
        let held = ledger
            .holdings
            .get(&sym)
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO);

        match side {
            Side::Buy => {
                if notional > ledger.cash {
                    return Err(EngineError::Order(format!(
                        "Insufficient cash: need {notional:.2}, have {:.2}",
                        ledger.cash
                    )));
                }
                ledger.cash -= notional;
                let holding = ledger.holdings.entry(sym.clone()).or_insert(Holding {
                    quantity: Decimal::ZERO,
                    avg_price: price,
                });
                let new_qty = holding.quantity + qty;
                holding.avg_price = (holding.quantity * holding.avg_price + notional) / new_qty;
                holding.quantity = new_qty;
            }
            Side::Sell => {
                if qty > held {
                    return Err(EngineError::Order(format!(
                        "Cannot sell {qty} {sym}: only {held} held"
                    )));
                }
                ledger.cash += notional;
                if qty == held {
                    ledger.holdings.remove(&sym);
                } else if let Some(holding) = ledger.holdings.get_mut(&sym) {
                    holding.quantity -= qty;
                }
            }
        }

        let receipt = TradeReceipt {
            order_id: format!("sim-{}", uuid::Uuid::new_v4()),
            symbol: sym,
            side,
            quantity,
            fill_price: price,
            timestamp: Utc::now(),
        };
        ledger.trades.push(receipt.clone());
        let excess = ledger.trades.len().saturating_sub(MAX_TRADE_LOG);
        ledger.trades.drain(..excess);

        info!(
            order_id = %receipt.order_id,
            side = %side,
            quantity,
            symbol = %receipt.symbol,
            price = %price,
            cash_after = %ledger.cash,
            "Sim order filled"
        );
        Ok(receipt)
    }

    fn name(&self) -> &str {
        BROKER_NAME
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Serves `BrokerMode::Sim`. Reuses one account per `account_id`, so
/// reconnecting does not reset the paper ledger.
pub struct SimBrokerFactory {
    starting_cash: Decimal,
    quotes: Option<Arc<dyn DataSource>>,
    accounts: Mutex<HashMap<String, Arc<SimBroker>>>,
}

impl SimBrokerFactory {
    pub fn new(starting_cash: Decimal, quotes: Option<Arc<dyn DataSource>>) -> Self {
        Self {
            starting_cash,
            quotes,
            accounts: Mutex::new(HashMap::new()),
        }
    }
}

impl BrokerFactory for SimBrokerFactory {
    fn build(&self, config: &BrokerConfig) -> EngineResult<Arc<dyn BrokerClient>> {
        if config.mode != BrokerMode::Sim {
            return Err(EngineError::Configuration(format!(
                "No backend available for mode '{}'; use 'sim' or register a factory for it",
                config.mode
            )));
        }

        let account_id = if config.account_id.trim().is_empty() {
            "SIM-001".to_string()
        } else {
            config.account_id.trim().to_string()
        };

        let mut accounts = self
            .accounts
            .lock()
            .map_err(|_| EngineError::InvalidState("sim factory lock poisoned".into()))?;
        let broker = accounts
            .entry(account_id.clone())
            .or_insert_with(|| {
                let mut broker = SimBroker::new(account_id, self.starting_cash);
                if let Some(quotes) = &self.quotes {
                    broker = broker.with_quotes(Arc::clone(quotes));
                }
                Arc::new(broker)
            })
            .clone();
        Ok(broker)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Mock broker for integration testing.
//!
//! A deterministic `BrokerClient` with one symbol and a fixed mark price.
//! Cash, holdings, latency and failures are controllable from test code.
//! Fills move cash and holdings immediately.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use trendwarden::brokers::BrokerClient;
use trendwarden::types::{AccountSnapshot, EngineError, EngineResult, Position, Side, TradeReceipt};

pub struct MockBroker {
    symbol: String,
    cash: Mutex<Decimal>,
    quantity: Mutex<Decimal>,
    price: Mutex<Decimal>,
    latency: Duration,
    trades: Mutex<Vec<TradeReceipt>>,
    /// If set, account queries fail with this error.
    force_error: Mutex<Option<EngineError>>,
    account_calls: AtomicUsize,
}

impl MockBroker {
    pub fn new(symbol: &str, cash: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            cash: Mutex::new(cash),
            quantity: Mutex::new(Decimal::ZERO),
            price: Mutex::new(price),
            latency: Duration::ZERO,
            trades: Mutex::new(Vec::new()),
            force_error: Mutex::new(None),
            account_calls: AtomicUsize::new(0),
        }
    }

    /// Delay every account query, to hold a decision cycle open.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_holding(self, quantity: Decimal) -> Self {
        *self.quantity.lock().unwrap() = quantity;
        self
    }

    pub fn set_error(&self, err: EngineError) {
        *self.force_error.lock().unwrap() = Some(err);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn set_cash(&self, cash: Decimal) {
        *self.cash.lock().unwrap() = cash;
    }

    pub fn orders(&self) -> Vec<TradeReceipt> {
        self.trades.lock().unwrap().clone()
    }

    pub fn account_calls(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst)
    }

    fn check_error(&self) -> EngineResult<()> {
        match self.force_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn get_account_info(&self) -> EngineResult<AccountSnapshot> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.check_error()?;
        let cash = *self.cash.lock().unwrap();
        let held = *self.quantity.lock().unwrap() * *self.price.lock().unwrap();
        Ok(AccountSnapshot {
            equity: cash + held,
            cash,
            buying_power: cash,
            currency: "USD".into(),
        })
    }

    async fn get_positions(&self) -> EngineResult<Vec<Position>> {
        self.check_error()?;
        let quantity = *self.quantity.lock().unwrap();
        if quantity.is_zero() {
            return Ok(Vec::new());
        }
        Ok(vec![Position {
            symbol: self.symbol.clone(),
            quantity,
            avg_price: *self.price.lock().unwrap(),
        }])
    }

    async fn get_trades(&self) -> EngineResult<Vec<TradeReceipt>> {
        Ok(self.orders())
    }

    async fn market_order(&self, symbol: &str, side: Side, quantity: u64) -> EngineResult<TradeReceipt> {
        let price = *self.price.lock().unwrap();
        let qty = Decimal::from(quantity);
        let signed = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        *self.cash.lock().unwrap() -= signed * price;
        *self.quantity.lock().unwrap() += signed;
        let receipt = TradeReceipt {
            order_id: format!("mock-{}", uuid::Uuid::new_v4()),
            symbol: symbol.to_string(),
            side,
            quantity,
            fill_price: price,
            timestamp: Utc::now(),
        };
        self.trades.lock().unwrap().push(receipt.clone());
        Ok(receipt)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

//! Broker integrations.
//!
//! Defines the `BrokerClient` trait consumed by the decision runner, the
//! persisted `BrokerConfig`, and the `BrokerFactory` seam that turns a
//! config into a connected client. Ships with:
//! - `SimBroker`: in-memory paper account filled at data-source closes
//!
//! Wire-protocol backends (paper API, live) plug in through their own
//! `BrokerFactory`; each one parses its responses into the validated
//! `AccountSnapshot` / `Position` types before they reach the engine.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::types::{AccountSnapshot, EngineError, EngineResult, Position, Side, TradeReceipt};

pub use sim::{SimBroker, SimBrokerFactory};

/// Abstraction over a brokerage account.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish the session. Fails with `EngineError::Connection` when the
    /// backend is unreachable or misconfigured.
    async fn connect(&self) -> EngineResult<()>;

    async fn disconnect(&self) -> EngineResult<()>;

    async fn get_account_info(&self) -> EngineResult<AccountSnapshot>;

    async fn get_positions(&self) -> EngineResult<Vec<Position>>;

    /// Fills recorded by this account, oldest first.
    async fn get_trades(&self) -> EngineResult<Vec<TradeReceipt>>;

    /// Submit a market order. Fails with `EngineError::Order` on rejection.
    async fn market_order(&self, symbol: &str, side: Side, quantity: u64) -> EngineResult<TradeReceipt>;

    /// Backend name for logging and status.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which backend the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    Sim,
    PaperApi,
    Live,
}

impl fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerMode::Sim => write!(f, "sim"),
            BrokerMode::PaperApi => write!(f, "paper_api"),
            BrokerMode::Live => write!(f, "live"),
        }
    }
}

/// Persisted connection settings (`broker_config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub account_id: String,
    pub host: String,
    pub port: u16,
    pub client_id: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Sim,
            account_id: String::new(),
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 7,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.host.trim().is_empty() {
            return Err(EngineError::Configuration("Broker host is empty".into()));
        }
        if self.port == 0 {
            return Err(EngineError::Configuration("Broker port must be non-zero".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds an unconnected client for a configuration.
pub trait BrokerFactory: Send + Sync {
    fn build(&self, config: &BrokerConfig) -> EngineResult<Arc<dyn BrokerClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde() {
        assert_eq!(serde_json::to_string(&BrokerMode::PaperApi).unwrap(), "\"paper_api\"");
    }

    #[test]
    fn test_config_defaults_partial_json() {
        let cfg: BrokerConfig = serde_json::from_str(r#"{"mode": "live", "port": 4001}"#).unwrap();
        assert_eq!(cfg.mode, BrokerMode::Live);
        assert_eq!(cfg.port, 4001);
        assert_eq!(cfg.host, "127.0.0.1");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_validate() {
        let cfg = BrokerConfig {
            port: 0,
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

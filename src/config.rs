//! Configuration loading from TOML.
//!
//! Reads `config.toml` (or the file named by `TRENDWARDEN_CONFIG`) and
//! deserializes it into strongly-typed sections. Every field has a default,
//! so a partial file or no file at all is valid.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::brokers::{BrokerConfig, BrokerMode};
use crate::engine::{ControllerSettings, RunnerConfig, ScheduleTime};
use crate::storage::DEFAULT_RETENTION;
use crate::strategy::SignalConfig;

/// Env var naming an alternative config file.
pub const CONFIG_ENV: &str = "TRENDWARDEN_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub signal: SignalConfig,
    pub scheduler: SchedulerSection,
    pub storage: StorageSection,
    pub broker: BrokerSection,
    pub data: DataSection,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSection {
    pub symbol: String,
    /// History symbol for the signal when it differs from the traded one.
    pub data_symbol: Option<String>,
    pub lookback_days: i64,
    pub resume_on_boot: bool,
    /// Fractional drawdown that trips the kill switch. 0 disables it.
    pub kill_switch_drawdown: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            symbol: "QQQ".to_string(),
            data_symbol: None,
            lookback_days: crate::engine::runner::DEFAULT_LOOKBACK_DAYS,
            resume_on_boot: true,
            kill_switch_drawdown: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSection {
    pub hour: u32,
    pub minute: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let at = ScheduleTime::default();
        Self {
            hour: at.hour,
            minute: at.minute,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSection {
    pub dir: PathBuf,
    pub equity_retention: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state"),
            equity_retention: DEFAULT_RETENTION,
        }
    }
}

/// Defaults used until a `broker_config.json` has been saved.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerSection {
    pub mode: BrokerMode,
    pub host: String,
    pub port: u16,
    pub client_id: u32,
    pub account_id: String,
    /// Run a connection test at boot.
    pub auto_connect: bool,
    pub sim_starting_cash: Decimal,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let base = BrokerConfig::default();
        Self {
            mode: base.mode,
            host: base.host,
            port: base.port,
            client_id: base.client_id,
            account_id: base.account_id,
            auto_connect: true,
            sim_starting_cash: Decimal::from(100_000),
        }
    }
}

impl BrokerSection {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            mode: self.mode,
            account_id: self.account_id.clone(),
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DataSection {
    /// Directory of `<SYMBOL>.csv` daily exports.
    pub csv_dir: PathBuf,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            csv_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8787,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `TRENDWARDEN_CONFIG` or `config.toml`; defaults when the
    /// default path does not exist. An explicitly named file must exist.
    pub fn load_default() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path),
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            Err(_) => {
                info!("No config.toml found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.symbol.trim().is_empty() {
            anyhow::bail!("engine.symbol must not be empty");
        }
        if self.engine.lookback_days <= 0 {
            anyhow::bail!("engine.lookback_days must be positive");
        }
        if !(0.0..1.0).contains(&self.engine.kill_switch_drawdown) {
            anyhow::bail!("engine.kill_switch_drawdown must be in [0, 1)");
        }
        if self.storage.equity_retention == 0 {
            anyhow::bail!("storage.equity_retention must be positive");
        }
        if self.broker.sim_starting_cash < Decimal::ZERO {
            anyhow::bail!("broker.sim_starting_cash must not be negative");
        }
        self.signal.validate().context("Invalid [signal] section")?;
        self.schedule().context("Invalid [scheduler] section")?;
        self.broker.to_broker_config().validate().context("Invalid [broker] section")?;
        Ok(())
    }

    pub fn schedule(&self) -> crate::types::EngineResult<ScheduleTime> {
        ScheduleTime::new(self.scheduler.hour, self.scheduler.minute)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            symbol: self.engine.symbol.trim().to_uppercase(),
            data_symbol: self
                .engine
                .data_symbol
                .as_ref()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
            lookback_days: self.engine.lookback_days,
        }
    }

    pub fn controller_settings(&self) -> Result<ControllerSettings> {
        Ok(ControllerSettings {
            symbol: self.engine.symbol.trim().to_uppercase(),
            schedule: self.schedule()?,
            equity_retention: self.storage.equity_retention,
            kill_switch_drawdown: self.engine.kill_switch_drawdown,
            ..ControllerSettings::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = AppConfig::from_toml("").unwrap();
        assert_eq!(cfg.engine.symbol, "QQQ");
        assert_eq!(cfg.scheduler.hour, 16);
        assert_eq!(cfg.scheduler.minute, 5);
        assert_eq!(cfg.signal.slow_span, 200);
        assert_eq!(cfg.storage.equity_retention, 2000);
        assert_eq!(cfg.broker.mode, BrokerMode::Sim);
        assert!(cfg.dashboard.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let cfg = AppConfig::from_toml(
            r#"
            [engine]
            symbol = "spy"
            data_symbol = "^GSPC"
            kill_switch_drawdown = 0.3

            [signal]
            vol_target_annual = 0.2

            [scheduler]
            hour = 15
            minute = 55

            [broker]
            mode = "paper_api"
            port = 4002
            sim_starting_cash = 25000
            "#,
        )
        .unwrap();

        assert_eq!(cfg.signal.vol_target_annual, 0.2);
        assert_eq!(cfg.signal.crash_buffer, 0.97);
        assert_eq!(cfg.broker.port, 4002);
        assert_eq!(cfg.broker.host, "127.0.0.1");
        assert_eq!(cfg.broker.sim_starting_cash, dec!(25000));

        let runner = cfg.runner_config();
        assert_eq!(runner.symbol, "SPY");
        assert_eq!(runner.data_symbol.as_deref(), Some("^GSPC"));

        let settings = cfg.controller_settings().unwrap();
        assert_eq!(settings.schedule.to_string(), "15:55");
        assert_eq!(settings.kill_switch_drawdown, 0.3);
    }

    #[test]
    fn test_rejects_bad_schedule() {
        let err = AppConfig::from_toml("[scheduler]\nhour = 24\n").unwrap_err();
        assert!(format!("{err:#}").contains("scheduler"));
    }

    #[test]
    fn test_rejects_bad_kill_switch() {
        assert!(AppConfig::from_toml("[engine]\nkill_switch_drawdown = 1.5\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_broker_mode() {
        assert!(AppConfig::from_toml("[broker]\nmode = \"margin\"\n").is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(AppConfig::load("/nonexistent/trendwarden.toml").is_err());
    }
}

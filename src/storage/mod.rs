//! Persistence layer.
//!
//! Flat JSON snapshots under one directory:
//! - `engine_state.json`: `EngineState`
//! - `equity_history.json`: `EquityHistory`
//! - `broker_config.json`: `BrokerConfig`
//!
//! Every write goes to a temp file in the same directory and is renamed
//! over the target, so a crash leaves either the old or the new file.
//! Loads never fail: an absent or unreadable file yields the default.

pub mod equity;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::brokers::BrokerConfig;
use crate::types::{EngineError, EngineResult, EngineState};

pub use equity::{EquityHistory, DEFAULT_RETENTION};

const ENGINE_STATE_FILE: &str = "engine_state.json";
const EQUITY_HISTORY_FILE: &str = "equity_history.json";
const BROKER_CONFIG_FILE: &str = "broker_config.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn engine_state_path(&self) -> PathBuf {
        self.dir.join(ENGINE_STATE_FILE)
    }

    pub fn equity_history_path(&self) -> PathBuf {
        self.dir.join(EQUITY_HISTORY_FILE)
    }

    pub fn broker_config_path(&self) -> PathBuf {
        self.dir.join(BROKER_CONFIG_FILE)
    }

    /// Load engine state; a fresh state for `symbol` when none is usable.
    pub fn load_engine_state(&self, symbol: &str) -> EngineState {
        match read_json::<EngineState>(&self.engine_state_path()) {
            Some(state) => {
                info!(
                    symbol = %state.symbol,
                    engine_active = state.engine_active,
                    last_run_date = ?state.last_run_date,
                    "Engine state loaded from disk"
                );
                state
            }
            None => EngineState::for_symbol(symbol),
        }
    }

    pub fn save_engine_state(&self, state: &EngineState) -> EngineResult<()> {
        write_json_atomic(&self.engine_state_path(), state)?;
        debug!(engine_active = state.engine_active, "Engine state saved");
        Ok(())
    }

    /// Load the equity curve, keeping at most the latest `retention` dates.
    pub fn load_equity_history(&self, retention: usize) -> EquityHistory {
        read_json::<EquityHistory>(&self.equity_history_path())
            .map(|h| EquityHistory::from_points(h.points().to_vec(), retention))
            .unwrap_or_default()
    }

    pub fn save_equity_history(&self, history: &EquityHistory) -> EngineResult<()> {
        write_json_atomic(&self.equity_history_path(), history)?;
        debug!(points = history.len(), "Equity history saved");
        Ok(())
    }

    pub fn load_broker_config(&self) -> BrokerConfig {
        read_json::<BrokerConfig>(&self.broker_config_path()).unwrap_or_default()
    }

    pub fn save_broker_config(&self, config: &BrokerConfig) -> EngineResult<()> {
        write_json_atomic(&self.broker_config_path(), config)?;
        info!(mode = %config.mode, host = %config.host, port = config.port, "Broker config saved");
        Ok(())
    }
}

/// Read and parse `path`. Missing files are silent; unreadable or corrupt
/// ones are logged and treated as missing.
fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No saved file, using defaults");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read file, using defaults");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt file, using defaults");
            None
        }
    }
}

/// Serialize `value` to a sibling temp file, fsync, then rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let persist_err = |what: &str, e: &dyn std::fmt::Display| {
        EngineError::Persistence(format!("{what} {}: {e}", path.display()))
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| persist_err("Failed to create directory for", &e))?;
        }
    }

    let json = serde_json::to_vec_pretty(value).map_err(|e| persist_err("Failed to serialise", &e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(persist_err("Failed to write", &e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

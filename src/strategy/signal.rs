//! Trend-following signal with volatility-targeted exposure.
//!
//! Long-only: fast/slow EMA crossover gated by a rising slow EMA and a
//! crash filter, scaled by realized volatility, smoothed, and clipped to
//! the cash-only range [0, 1].

use serde::Deserialize;
use tracing::debug;

use crate::types::{EngineError, EngineResult, PriceSeries, SignalState, TargetWeight};

/// Trading days per year used to annualize daily volatility.
const TRADING_DAYS: f64 = 252.0;

/// Below this, realized volatility is treated as undefined.
const VOL_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub fast_span: usize,
    pub slow_span: usize,
    /// Fast EMA must exceed slow EMA by this fraction to count as a cross.
    pub trend_buffer: f64,
    /// Periods back used to test whether the slow EMA is rising.
    pub slope_lookback: usize,
    pub vol_window: usize,
    pub vol_target_annual: f64,
    /// Risk-off when price < slow EMA × crash_buffer.
    pub crash_buffer: f64,
    pub min_vol_floor: f64,
    pub smoothing_span: usize,
    pub cash_only_ceiling: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            fast_span: 50,
            slow_span: 200,
            trend_buffer: 0.001,
            slope_lookback: 50,
            vol_window: 20,
            vol_target_annual: 0.25,
            crash_buffer: 0.97,
            min_vol_floor: 0.12,
            smoothing_span: 3,
            cash_only_ceiling: 1.0,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.fast_span == 0 || self.slow_span == 0 || self.smoothing_span == 0 {
            return Err(EngineError::Configuration(
                "EMA spans must be at least 1".into(),
            ));
        }
        if self.vol_window < 2 {
            return Err(EngineError::Configuration(
                "vol_window must be at least 2 for a sample standard deviation".into(),
            ));
        }
        if !(self.vol_target_annual > 0.0) {
            return Err(EngineError::Configuration(
                "vol_target_annual must be positive".into(),
            ));
        }
        if !(self.min_vol_floor > 0.0) {
            return Err(EngineError::Configuration(
                "min_vol_floor must be positive".into(),
            ));
        }
        if !(self.cash_only_ceiling > 0.0 && self.cash_only_ceiling <= 1.0) {
            return Err(EngineError::Configuration(
                "cash_only_ceiling must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Indicator helpers
// ---------------------------------------------------------------------------

/// Recursive EMA seeded with the first value (no bias adjustment).
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    for (i, &v) in values.iter().enumerate() {
        if i == 0 {
            out.push(v);
        } else {
            let prev = out[i - 1];
            out.push(alpha * v + (1.0 - alpha) * prev);
        }
    }
    out
}

/// Simple daily returns; the first entry is 0.
pub fn daily_returns(prices: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(prices.len());
    for i in 0..prices.len() {
        if i == 0 {
            out.push(0.0);
        } else {
            out.push(prices[i] / prices[i - 1] - 1.0);
        }
    }
    out
}

/// Rolling sample (n-1) standard deviation; `None` until the window fills.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window < 2 || values.len() < window {
        return out;
    }
    for end in (window - 1)..values.len() {
        let slice = &values[end + 1 - window..=end];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        out[end] = Some(var.sqrt());
    }
    out
}

/// Leverage implied by volatility targeting, including the quiet-market
/// damper and the cash-only ceiling. Undefined volatility gives 0.
pub(crate) fn vol_scaled_leverage(realized_vol: Option<f64>, cfg: &SignalConfig) -> f64 {
    let vol = match realized_vol {
        Some(v) if v.is_finite() && v > VOL_EPSILON => v,
        _ => return 0.0,
    };
    let mut leverage = cfg.vol_target_annual / vol;
    if cfg.min_vol_floor > 0.0 {
        leverage *= (vol / cfg.min_vol_floor).clamp(0.5, 1.0);
    }
    if !leverage.is_finite() {
        return 0.0;
    }
    leverage.clamp(0.0, cfg.cash_only_ceiling)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Latest evaluation of the model, with the intermediate values kept for logs.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSnapshot {
    pub target: TargetWeight,
    pub signal_state: SignalState,
    pub last_price: f64,
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub realized_vol: Option<f64>,
    pub trend_up: bool,
    pub raw_weight: f64,
}

#[derive(Debug, Clone)]
pub struct SignalEngine {
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Daily target weights for every usable bar in `prices`.
    pub fn compute_target_weights(&self, prices: &PriceSeries) -> EngineResult<Vec<TargetWeight>> {
        Ok(self
            .evaluate(prices)?
            .into_iter()
            .map(|s| s.target)
            .collect())
    }

    /// Evaluate the whole history and return only the most recent day.
    pub fn latest(&self, prices: &PriceSeries) -> EngineResult<SignalSnapshot> {
        self.evaluate(prices)?
            .pop()
            .ok_or_else(|| EngineError::InsufficientData(format!("{}: no weights produced", prices.symbol)))
    }

    fn evaluate(&self, prices: &PriceSeries) -> EngineResult<Vec<SignalSnapshot>> {
        let cfg = &self.config;

        let cleaned: Vec<_> = prices
            .bars()
            .iter()
            .filter(|b| b.adj_close.is_finite() && b.adj_close > 0.0)
            .map(|b| (b.date, b.adj_close))
            .collect();

        if cleaned.is_empty() {
            return Err(EngineError::InsufficientData(format!(
                "{}: no usable prices in {} bars",
                prices.symbol,
                prices.len()
            )));
        }
        if cleaned.len() < cfg.slow_span {
            debug!(
                symbol = %prices.symbol,
                bars = cleaned.len(),
                slow_span = cfg.slow_span,
                "Short history, slow EMA not fully warmed up"
            );
        }

        let closes: Vec<f64> = cleaned.iter().map(|(_, p)| *p).collect();
        let fast = ema(&closes, cfg.fast_span);
        let slow = ema(&closes, cfg.slow_span);
        let vol: Vec<Option<f64>> = rolling_std(&daily_returns(&closes), cfg.vol_window)
            .into_iter()
            .map(|s| s.map(|v| v * TRADING_DAYS.sqrt()))
            .collect();

        let mut raw = Vec::with_capacity(closes.len());
        let mut trend_flags = Vec::with_capacity(closes.len());
        for i in 0..closes.len() {
            let cross_up = fast[i] > slow[i] * (1.0 + cfg.trend_buffer);
            let slope_up = if i >= cfg.slope_lookback {
                slow[i] > slow[i - cfg.slope_lookback]
            } else {
                true
            };
            let crash_off = closes[i] < slow[i] * cfg.crash_buffer;
            let trend_up = cross_up && slope_up && !crash_off;

            let base = if trend_up { 1.0 } else { 0.0 };
            raw.push(base * vol_scaled_leverage(vol[i], cfg));
            trend_flags.push(trend_up);
        }

        let smoothed = ema(&raw, cfg.smoothing_span);

        Ok(cleaned
            .iter()
            .enumerate()
            .map(|(i, (date, price))| {
                let weight = if smoothed[i].is_finite() {
                    smoothed[i].clamp(0.0, 1.0)
                } else {
                    0.0
                };
                SignalSnapshot {
                    target: TargetWeight {
                        date: *date,
                        symbol: prices.symbol.clone(),
                        weight,
                    },
                    signal_state: SignalState::from_weight(weight),
                    last_price: *price,
                    fast_ema: fast[i],
                    slow_ema: slow[i],
                    realized_vol: vol[i],
                    trend_up: trend_flags[i],
                    raw_weight: raw[i],
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

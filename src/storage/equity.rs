//! Equity history: one snapshot per calendar date, oldest first.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::EquitySnapshot;

/// Default retention cap for the equity history.
pub const DEFAULT_RETENTION: usize = 2000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EquityHistory {
    points: Vec<EquitySnapshot>,
}

impl EquityHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from raw points, restoring date order and date uniqueness,
    /// and keep the latest `retention` dates. A later entry for a repeated
    /// date wins.
    pub fn from_points(points: Vec<EquitySnapshot>, retention: usize) -> Self {
        let mut history = Self::new();
        for point in points {
            history.upsert(point, usize::MAX);
        }
        history.evict(retention);
        history
    }

    pub fn points(&self) -> &[EquitySnapshot] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&EquitySnapshot> {
        self.points.last()
    }

    /// Insert a snapshot, replacing any entry with the same date, then evict
    /// the oldest entries beyond `retention`.
    pub fn upsert(&mut self, snapshot: EquitySnapshot, retention: usize) {
        match self.points.binary_search_by_key(&snapshot.date, |p| p.date) {
            Ok(idx) => self.points[idx] = snapshot,
            Err(idx) => self.points.insert(idx, snapshot),
        }

        self.evict(retention);
    }

    fn evict(&mut self, retention: usize) {
        let retention = retention.max(1);
        if self.points.len() > retention {
            let excess = self.points.len() - retention;
            self.points.drain(..excess);
        }
    }

    /// `last / first - 1`. None with fewer than two points or a zero start.
    pub fn live_return(&self) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }
        let first = self.points.first()?.equity;
        let last = self.points.last()?.equity;
        if first <= Decimal::ZERO {
            return None;
        }
        (last / first - Decimal::ONE).to_f64()
    }

    /// Minimum of `equity / running_peak - 1` over the history (≤ 0).
    /// None with fewer than two points.
    pub fn max_drawdown(&self) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }
        let mut peak = f64::NEG_INFINITY;
        let mut worst = 0.0_f64;
        for point in &self.points {
            let equity = point.equity.to_f64().unwrap_or(0.0);
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                worst = worst.min(equity / peak - 1.0);
            }
        }
        Some(worst)
    }
}

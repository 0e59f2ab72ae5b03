//! Strategy: trend/volatility signal and cash-only sizing.

pub mod signal;
pub mod sizing;

pub use signal::{SignalConfig, SignalEngine, SignalSnapshot};
pub use sizing::{PositionSizer, SizedOrder};

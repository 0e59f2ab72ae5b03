//! Cash-only position sizing.
//!
//! Converts a target weight into whole shares, bounded both by the
//! notional the weight implies and by literal cash on hand. A buy never
//! spends more than the cash available.

use rust_decimal::prelude::*;
use tracing::{debug, warn};

use crate::types::{Order, Side};

/// Outcome of sizing one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedOrder {
    pub target_qty: i64,
    pub current_qty: i64,
    /// `target_qty - current_qty`; positive buys, negative sells.
    pub delta: i64,
    pub side: Option<Side>,
    /// Set when the price was unusable. `target_qty` is then 0 and the
    /// caller must not trade on it.
    pub data_fault: bool,
}

impl SizedOrder {
    /// The delta market order, if any.
    pub fn order(&self, symbol: &str) -> Option<Order> {
        self.side.map(|side| Order {
            symbol: symbol.to_string(),
            side,
            quantity: self.delta.unsigned_abs(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionSizer;

impl PositionSizer {
    pub fn new() -> Self {
        Self
    }

    /// Size a target weight against live account values.
    ///
    /// target_qty = floor(min(weight × equity, cash) / price)
    pub fn size(
        &self,
        equity: Decimal,
        cash: Decimal,
        price: Decimal,
        target_weight: f64,
        current_qty: Decimal,
    ) -> SizedOrder {
        let current = current_qty
            .round()
            .to_i64()
            .unwrap_or(0);

        if price <= Decimal::ZERO {
            warn!(%price, "Non-positive price, refusing to size");
            return SizedOrder {
                target_qty: 0,
                current_qty: current,
                delta: 0,
                side: None,
                data_fault: true,
            };
        }

        let weight = if target_weight.is_finite() {
            target_weight.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let weight = Decimal::from_f64(weight).unwrap_or(Decimal::ZERO);

        let equity = equity.max(Decimal::ZERO);
        let cash = cash.max(Decimal::ZERO);
        let budget = (weight * equity).min(cash);

        let target_qty = (budget / price)
            .floor()
            .to_i64()
            .unwrap_or(0)
            .max(0);

        let delta = target_qty - current;
        let side = match delta {
            d if d > 0 => Some(Side::Buy),
            d if d < 0 => Some(Side::Sell),
            _ => None,
        };

        debug!(
            %equity,
            %cash,
            %price,
            %weight,
            target_qty,
            current_qty = current,
            delta,
            "Order sized"
        );

        SizedOrder {
            target_qty,
            current_qty: current,
            delta,
            side,
            data_fault: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weight_constrained_buy() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(10000), dec!(50), 0.5, dec!(0));
        assert_eq!(sized.target_qty, 100);
        assert_eq!(sized.delta, 100);
        assert_eq!(sized.side, Some(Side::Buy));
        assert_eq!(
            sized.order("QQQ"),
            Some(Order {
                symbol: "QQQ".into(),
                side: Side::Buy,
                quantity: 100
            })
        );
    }

    #[test]
    fn test_cash_constrained_buy() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(2000), dec!(50), 0.5, dec!(0));
        assert_eq!(sized.target_qty, 40);
        assert_eq!(sized.delta, 40);
    }

    #[test]
    fn test_sell_down_to_target() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(5000), dec!(50), 0.2, dec!(100));
        assert_eq!(sized.target_qty, 40);
        assert_eq!(sized.delta, -60);
        assert_eq!(sized.side, Some(Side::Sell));
        assert_eq!(sized.order("QQQ").unwrap().quantity, 60);
    }

    #[test]
    fn test_already_at_target() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(10000), dec!(50), 0.5, dec!(100));
        assert_eq!(sized.delta, 0);
        assert!(sized.side.is_none());
        assert!(sized.order("QQQ").is_none());
    }

    #[test]
    fn test_fractional_holding_is_rounded() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(10000), dec!(50), 0.5, dec!(99.6));
        assert_eq!(sized.current_qty, 100);
        assert_eq!(sized.delta, 0);
    }

    #[test]
    fn test_non_positive_price_is_data_fault() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(10000), dec!(0), 0.5, dec!(10));
        assert!(sized.data_fault);
        assert_eq!(sized.target_qty, 0);
        assert!(sized.side.is_none());
    }

    #[test]
    fn test_weight_is_clamped() {
        let sizer = PositionSizer::new();
        let over = sizer.size(dec!(1000), dec!(5000), dec!(10), 3.0, dec!(0));
        assert_eq!(over.target_qty, 100);
        let under = sizer.size(dec!(1000), dec!(1000), dec!(10), -1.0, dec!(0));
        assert_eq!(under.target_qty, 0);
    }

    #[test]
    fn test_holding_does_not_count_as_cash() {
        // Fully invested with no cash left: the cash bound sizes the target to zero.
        let sized = PositionSizer::new().size(dec!(10000), dec!(0), dec!(50), 1.0, dec!(200));
        assert_eq!(sized.target_qty, 0);
        assert_eq!(sized.delta, -200);
        assert_eq!(sized.side, Some(Side::Sell));
    }

    #[test]
    fn test_cash_bound_applies_with_existing_holding() {
        let sized = PositionSizer::new().size(dec!(10000), dec!(1000), dec!(50), 1.0, dec!(100));
        assert_eq!(sized.target_qty, 20);
        assert_eq!(sized.delta, -80);
    }

    #[test]
    fn test_holding_at_cash_bound_is_stable() {
        // 50 held @ 200 plus 10000 cash: floor(min(20000, 10000) / 200) = 50.
        let sizer = PositionSizer::new();
        let first = sizer.size(dec!(20000), dec!(10000), dec!(200), 1.0, dec!(50));
        let second = sizer.size(dec!(20000), dec!(10000), dec!(200), 1.0, dec!(50));
        assert_eq!(first, second);
        assert_eq!(first.delta, 0);
        assert!(first.order("QQQ").is_none());
    }

    #[test]
    fn test_target_bounded_when_holding() {
        let sizer = PositionSizer::new();
        for (equity, cash, price, weight, held) in [
            (dec!(10000), dec!(1000), dec!(50), 1.0, dec!(100)),
            (dec!(10000), dec!(0), dec!(50), 1.0, dec!(200)),
            (dec!(20000), dec!(10000), dec!(200), 0.6, dec!(50)),
            (dec!(5432.10), dec!(4321.09), dec!(12.34), 0.33, dec!(7)),
            (dec!(100000), dec!(99000), dec!(401.17), 1.0, dec!(2.4)),
        ] {
            let sized = sizer.size(equity, cash, price, weight, held);
            assert!(sized.target_qty >= 0);
            let w = Decimal::from_f64(weight).unwrap();
            let spent = Decimal::from(sized.target_qty) * price;
            assert!(spent <= (w * equity).min(cash) + price);
            assert_eq!(sized.delta, sized.target_qty - sized.current_qty);
            if sized.delta > 0 {
                assert!(Decimal::from(sized.delta) * price <= cash);
            }
        }
    }

    #[test]
    fn test_never_exceeds_budget() {
        let sizer = PositionSizer::new();
        for (equity, cash, price, weight) in [
            (dec!(10000), dec!(10000), dec!(33.33), 0.77),
            (dec!(987.65), dec!(120.5), dec!(7.01), 1.0),
            (dec!(0), dec!(0), dec!(12), 0.5),
            (dec!(250000), dec!(1000), dec!(401.17), 0.9),
            (dec!(5000), dec!(6000), dec!(4999.99), 1.0),
        ] {
            let sized = sizer.size(equity, cash, price, weight, dec!(0));
            assert!(sized.target_qty >= 0);
            let spent = Decimal::from(sized.target_qty) * price;
            let w = Decimal::from_f64(weight).unwrap();
            assert!(spent <= (w * equity).min(cash));
            assert!(spent <= cash);
        }
    }
}

use common::{Candle, PositionSnapshot, TradeSignal};

use crate::{FeatureRow, Strategy, StrategyFrame};

/// Short-horizon momentum entry: acts on strong 1- and 3-candle returns.
/// Most of its value comes from the intra-bar tick hook, where it reacts
/// faster than candle-driven strategies.
pub struct Sniper {
    pub ret1_pct: f64,
    pub ret3_pct: f64,
}

impl Default for Sniper {
    fn default() -> Self {
        Self {
            ret1_pct: 1.0,
            ret3_pct: 2.0,
        }
    }
}

impl Strategy for Sniper {
    fn name(&self) -> &'static str {
        "Sniper"
    }

    fn features(&self) -> &'static [&'static str] {
        &["ret_1", "ret_3"]
    }

    fn apply(&self, candles: &[Candle], _position: Option<&PositionSnapshot>) -> StrategyFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let rows = (3..candles.len())
            .map(|i| {
                let ret_1 = pct_change(closes[i - 1], closes[i]);
                let ret_3 = pct_change(closes[i - 3], closes[i]);

                let signal = if ret_1 >= self.ret1_pct && ret_3 >= self.ret3_pct {
                    TradeSignal::Buy
                } else if ret_1 <= -self.ret1_pct && ret_3 <= -self.ret3_pct {
                    TradeSignal::Sell
                } else {
                    TradeSignal::Wait
                };

                FeatureRow {
                    candle: candles[i],
                    values: vec![ret_1, ret_3],
                    signal,
                }
            })
            .collect();

        StrategyFrame {
            features: self.features().iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    // More sensitive than the default spike detector.
    fn tick_spike_pct(&self) -> f64 {
        0.5
    }
}

fn pct_change(from: f64, to: f64) -> f64 {
    if from <= 0.0 {
        return 0.0;
    }
    (to - from) / from * 100.0
}

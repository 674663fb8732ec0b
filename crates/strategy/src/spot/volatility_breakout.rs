use common::{Candle, PositionSnapshot, TradeSignal};

use crate::indicators::{rolling_mean, rolling_std};
use crate::{FeatureRow, Strategy, StrategyFrame};

/// Breakout over rolling bands: a close beyond `mean ± k·std` of the
/// *previous* window is a breakout in that direction.
pub struct VolatilityBreakout {
    window: usize,
    band_width: f64,
}

impl VolatilityBreakout {
    pub fn new(window: usize, band_width: f64) -> Self {
        Self { window, band_width }
    }
}

impl Default for VolatilityBreakout {
    fn default() -> Self {
        Self::new(20, 2.0)
    }
}

impl Strategy for VolatilityBreakout {
    fn name(&self) -> &'static str {
        "VolatilityBreakout"
    }

    fn features(&self) -> &'static [&'static str] {
        &["volatility", "band_upper", "band_lower"]
    }

    fn apply(&self, candles: &[Candle], _position: Option<&PositionSnapshot>) -> StrategyFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let means = rolling_mean(&closes, self.window);
        let stds = rolling_std(&closes, self.window);

        let mut rows = Vec::new();
        for i in 1..candles.len() {
            // Bands come from the window ending at the previous candle, so a
            // breakout candle can't dilute its own band.
            let (Some(mean), Some(std)) = (means[i - 1], stds[i - 1]) else {
                continue;
            };
            let upper = mean + self.band_width * std;
            let lower = mean - self.band_width * std;
            let close = closes[i];

            let signal = if std > 0.0 && close > upper {
                TradeSignal::Buy
            } else if std > 0.0 && close < lower {
                TradeSignal::Sell
            } else {
                TradeSignal::Wait
            };

            rows.push(FeatureRow {
                candle: candles[i],
                values: vec![std, upper, lower],
                signal,
            });
        }

        StrategyFrame {
            features: self.features().iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }
}

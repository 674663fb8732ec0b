use common::{Candle, PositionSnapshot, TradeSignal};

use crate::indicators::RsiIndicator;
use crate::{FeatureRow, Strategy, StrategyFrame};

/// Futures RSI reversion: extreme-only zones (20/80) and a normalized RSI
/// feature for the classifier. While a position is open, only signals in the
/// position's favor pass; reversals are left to the engine's flip path.
pub struct RsiReversion {
    rsi: RsiIndicator,
    norm_window: usize,
}

impl RsiReversion {
    pub fn new(period: usize) -> Self {
        Self {
            rsi: RsiIndicator::new(period, 80.0, 20.0),
            norm_window: 50,
        }
    }
}

impl Default for RsiReversion {
    fn default() -> Self {
        Self::new(14)
    }
}

impl Strategy for RsiReversion {
    fn name(&self) -> &'static str {
        "RsiReversion"
    }

    fn features(&self) -> &'static [&'static str] {
        &["rsi", "rsi_norm"]
    }

    fn apply(&self, candles: &[Candle], position: Option<&PositionSnapshot>) -> StrategyFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi_series = self.rsi.series(&closes);
        let holding = position.map(|p| !p.is_flat()).unwrap_or(false);

        let mut rows = Vec::new();
        for i in 0..candles.len() {
            let Some(rsi) = rsi_series[i] else { continue };

            // Min-max normalization over the trailing window.
            let window_start = i.saturating_sub(self.norm_window - 1);
            let window: Vec<f64> = rsi_series[window_start..=i]
                .iter()
                .flatten()
                .copied()
                .collect();
            let (min, max) = window
                .iter()
                .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let rsi_norm = if max > min { (rsi - min) / (max - min) } else { 0.5 };

            let mut signal = if rsi <= self.rsi.oversold {
                TradeSignal::Buy
            } else if rsi >= self.rsi.overbought {
                TradeSignal::Sell
            } else {
                TradeSignal::Wait
            };
            if holding && signal != TradeSignal::Wait {
                // Keep adding in the open direction only.
                signal = TradeSignal::Wait;
            }

            rows.push(FeatureRow {
                candle: candles[i],
                values: vec![rsi, rsi_norm],
                signal,
            });
        }

        StrategyFrame {
            features: self.features().iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                ts: start + Duration::minutes(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 100.0,
            })
            .collect()
    }

    #[test]
    fn moderate_dip_is_not_extreme_enough() {
        let strategy = RsiReversion::new(3);
        // Mixed series that lands around RSI 30-40: spot would buy, futures waits.
        let closes = vec![100.0, 99.0, 100.0, 99.0, 98.5, 98.0, 98.4];
        let frame = strategy.apply(&candles(&closes), None);
        assert_eq!(frame.last_signal(), TradeSignal::Wait);
    }

    #[test]
    fn open_position_suppresses_candle_entries() {
        let strategy = RsiReversion::new(3);
        let closes = vec![100.0, 98.0, 96.0, 94.0, 92.0, 90.0];
        let pos = PositionSnapshot { qty: 1.0, avg_price: 95.0 };
        let frame = strategy.apply(&candles(&closes), Some(&pos));
        assert_eq!(frame.last_signal(), TradeSignal::Wait);
    }
}

use common::{Candle, PositionSnapshot, TradeSignal};

use crate::indicators::ema_series;
use crate::{FeatureRow, Strategy, StrategyFrame};

/// Classic EMA crossover trend-follower: signal only on the crossover candle,
/// not while the trend persists.
pub struct TrendEma {
    fast: usize,
    slow: usize,
}

impl TrendEma {
    pub fn new(fast: usize, slow: usize) -> Self {
        assert!(fast < slow, "fast EMA period must be shorter than slow");
        Self { fast, slow }
    }
}

impl Default for TrendEma {
    fn default() -> Self {
        Self::new(20, 50)
    }
}

impl Strategy for TrendEma {
    fn name(&self) -> &'static str {
        "TrendEma"
    }

    fn features(&self) -> &'static [&'static str] {
        &["ema_fast", "ema_slow", "trend"]
    }

    fn apply(&self, candles: &[Candle], _position: Option<&PositionSnapshot>) -> StrategyFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = ema_series(&closes, self.fast);
        let slow = ema_series(&closes, self.slow);

        let mut rows = Vec::new();
        let mut prev: Option<(f64, f64)> = None;
        for i in 0..candles.len() {
            let (Some(f), Some(s)) = (fast[i], slow[i]) else {
                continue;
            };
            let trend = if f > s { 1.0 } else { -1.0 };

            let signal = match prev {
                Some((pf, ps)) if pf <= ps && f > s => TradeSignal::Buy,
                Some((pf, ps)) if pf >= ps && f < s => TradeSignal::Sell,
                _ => TradeSignal::Wait,
            };
            prev = Some((f, s));

            rows.push(FeatureRow {
                candle: candles[i],
                values: vec![f, s, trend],
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
    fn reversal_produces_one_crossover_signal() {
        let strategy = TrendEma::new(3, 8);
        // Long decline then a sharp recovery: exactly one bullish crossover.
        let mut closes: Vec<f64> = (0..30).map(|i| 150.0 - i as f64).collect();
        closes.extend((0..15).map(|i| 121.0 + i as f64 * 3.0));
        let frame = strategy.apply(&candles(&closes), None);

        let buys = frame
            .rows
            .iter()
            .filter(|r| r.signal == TradeSignal::Buy)
            .count();
        assert_eq!(buys, 1);
    }

    #[test]
    fn steady_trend_does_not_re_signal() {
        let strategy = TrendEma::new(3, 8);
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let frame = strategy.apply(&candles(&closes), None);
        // Fast stays above slow for the whole warm run; no fresh crossover.
        assert_eq!(frame.last_signal(), TradeSignal::Wait);
    }
}

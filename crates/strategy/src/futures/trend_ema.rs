use common::{Candle, PositionSnapshot, TradeSignal};

use crate::indicators::ema_series;
use crate::{FeatureRow, Strategy, StrategyFrame};

/// Fast EMA crossover for futures (9/21) with a slope filter: the fast EMA
/// must already point in the crossover's direction.
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
        Self::new(9, 21)
    }
}

impl Strategy for TrendEma {
    fn name(&self) -> &'static str {
        "TrendEma"
    }

    fn features(&self) -> &'static [&'static str] {
        &["ema_fast", "ema_slow", "slope"]
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
            let slope = prev.map(|(pf, _)| f - pf).unwrap_or(0.0);

            let signal = match prev {
                Some((pf, ps)) if pf <= ps && f > s && slope > 0.0 => TradeSignal::Buy,
                Some((pf, ps)) if pf >= ps && f < s && slope < 0.0 => TradeSignal::Sell,
                _ => TradeSignal::Wait,
            };
            prev = Some((f, s));

            rows.push(FeatureRow {
                candle: candles[i],
                values: vec![f, s, slope],
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
    fn recovery_crossover_signals_buy_once() {
        let strategy = TrendEma::new(3, 8);
        let mut closes: Vec<f64> = (0..25).map(|i| 150.0 - i as f64).collect();
        closes.extend((0..12).map(|i| 126.0 + i as f64 * 4.0));
        let frame = strategy.apply(&candles(&closes), None);

        let buys = frame
            .rows
            .iter()
            .filter(|r| r.signal == TradeSignal::Buy)
            .count();
        assert_eq!(buys, 1);
    }
}

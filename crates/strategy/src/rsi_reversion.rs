use common::{Candle, PositionSnapshot, TradeSignal};

use crate::indicators::RsiIndicator;
use crate::{FeatureRow, Strategy, StrategyFrame};

/// Plain RSI mean-reversion, usable on any market. The spot and futures
/// variants refine this with volume and volatility filters.
pub struct RsiReversion {
    rsi: RsiIndicator,
}

impl RsiReversion {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        Self {
            rsi: RsiIndicator::new(period, overbought, oversold),
        }
    }
}

impl Default for RsiReversion {
    fn default() -> Self {
        Self::new(14, 70.0, 30.0)
    }
}

impl Strategy for RsiReversion {
    fn name(&self) -> &'static str {
        "RsiReversion"
    }

    fn features(&self) -> &'static [&'static str] {
        &["rsi"]
    }

    fn apply(&self, candles: &[Candle], _position: Option<&PositionSnapshot>) -> StrategyFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi_series = self.rsi.series(&closes);

        let rows = candles
            .iter()
            .zip(rsi_series)
            .filter_map(|(candle, rsi)| {
                let rsi = rsi?;
                let signal = if rsi <= self.rsi.oversold {
                    TradeSignal::Buy
                } else if rsi >= self.rsi.overbought {
                    TradeSignal::Sell
                } else {
                    TradeSignal::Wait
                };
                Some(FeatureRow {
                    candle: *candle,
                    values: vec![rsi],
                    signal,
                })
            })
            .collect();

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

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
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
    fn oversold_series_signals_buy() {
        let strategy = RsiReversion::new(3, 70.0, 30.0);
        let closes = vec![100.0, 98.0, 96.0, 94.0, 92.0, 90.0];
        let frame = strategy.apply(&candles_from_closes(&closes), None);
        assert_eq!(frame.last_signal(), TradeSignal::Buy);
    }

    #[test]
    fn overbought_series_signals_sell() {
        let strategy = RsiReversion::new(3, 70.0, 30.0);
        let closes = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let frame = strategy.apply(&candles_from_closes(&closes), None);
        assert_eq!(frame.last_signal(), TradeSignal::Sell);
    }

    #[test]
    fn warmup_candles_produce_no_rows() {
        let strategy = RsiReversion::default();
        let closes = vec![100.0, 101.0, 102.0];
        let frame = strategy.apply(&candles_from_closes(&closes), None);
        assert!(frame.rows.is_empty());
        assert_eq!(frame.last_signal(), TradeSignal::Wait);
    }
}

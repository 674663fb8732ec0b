use common::{Candle, PositionSnapshot, TradeSignal};

use crate::indicators::{ema_series, rolling_mean, RsiIndicator};
use crate::{FeatureRow, Strategy, StrategyFrame, TickContext};

/// Spot RSI reversion with a smoothed RSI and a relative-volume confirmation
/// filter. Shadows the root `RsiReversion` on spot markets.
pub struct RsiReversion {
    rsi: RsiIndicator,
    rsi_smooth_span: usize,
    vol_window: usize,
    min_vol_ratio: f64,
}

impl RsiReversion {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        Self {
            rsi: RsiIndicator::new(period, overbought, oversold),
            rsi_smooth_span: 3,
            vol_window: 20,
            min_vol_ratio: 0.8,
        }
    }
}

impl Default for RsiReversion {
    fn default() -> Self {
        Self::new(14, 75.0, 25.0)
    }
}

impl Strategy for RsiReversion {
    fn name(&self) -> &'static str {
        "RsiReversion"
    }

    fn features(&self) -> &'static [&'static str] {
        &["rsi", "rsi_smooth", "vol_ratio"]
    }

    fn apply(&self, candles: &[Candle], _position: Option<&PositionSnapshot>) -> StrategyFrame {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let rsi_series = self.rsi.series(&closes);
        // Smooth only the computed part of the RSI series so the warm-up
        // gap cannot bleed into later values.
        let smooth_series: Vec<Option<f64>> = match rsi_series.iter().position(|v| v.is_some()) {
            Some(start) => {
                let tail: Vec<f64> = rsi_series[start..].iter().flatten().copied().collect();
                let mut out = vec![None; start];
                out.extend(ema_series(&tail, self.rsi_smooth_span));
                out
            }
            None => vec![None; rsi_series.len()],
        };
        let vol_mean = rolling_mean(&volumes, self.vol_window);

        let mut rows = Vec::new();
        for i in 0..candles.len() {
            let (Some(rsi), Some(smooth), Some(mean)) =
                (rsi_series[i], smooth_series[i], vol_mean[i])
            else {
                continue;
            };
            if mean <= 0.0 {
                continue;
            }
            let vol_ratio = volumes[i] / mean;
            let confirmed = vol_ratio > self.min_vol_ratio;

            let signal = if rsi <= self.rsi.oversold && confirmed {
                TradeSignal::Buy
            } else if rsi >= self.rsi.overbought && confirmed {
                TradeSignal::Sell
            } else {
                TradeSignal::Wait
            };

            rows.push(FeatureRow {
                candle: candles[i],
                values: vec![rsi, smooth, vol_ratio],
                signal,
            });
        }

        StrategyFrame {
            features: self.features().iter().map(|s| s.to_string()).collect(),
            rows,
        }
    }

    /// Reversion tick rule: a sharp drop is an entry, a sharp pop an exit.
    fn on_price_tick(
        &self,
        price: f64,
        _position: Option<&PositionSnapshot>,
        ctx: &TickContext,
    ) -> TradeSignal {
        if price <= 0.0 {
            return TradeSignal::Wait;
        }
        let prev = match ctx.prev_price {
            Some(p) if p > 0.0 => p,
            _ => return TradeSignal::Wait,
        };
        let change = (price - prev) / prev * 100.0;
        let spike = self.tick_spike_pct();
        if change <= -spike {
            TradeSignal::Buy
        } else if change >= spike {
            TradeSignal::Sell
        } else {
            TradeSignal::Wait
        }
    }

    fn tick_spike_pct(&self) -> f64 {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn candles(closes: &[f64], volume: f64) -> Vec<Candle> {
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
                volume,
            })
            .collect()
    }

    #[test]
    fn deep_selloff_with_volume_signals_buy() {
        let strategy = RsiReversion::new(3, 75.0, 25.0);
        let mut closes: Vec<f64> = (0..25).map(|_| 100.0).collect();
        closes.extend([98.0, 96.0, 93.0, 90.0, 87.0]);
        let frame = strategy.apply(&candles(&closes, 120.0), None);
        assert_eq!(frame.last_signal(), TradeSignal::Buy);
    }

    #[test]
    fn tick_rule_is_reversion_not_momentum() {
        let strategy = RsiReversion::default();
        let ctx = TickContext { prev_price: Some(100.0) };
        assert_eq!(strategy.on_price_tick(99.0, None, &ctx), TradeSignal::Buy);
        assert_eq!(strategy.on_price_tick(101.0, None, &ctx), TradeSignal::Sell);
    }
}

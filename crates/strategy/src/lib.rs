pub mod futures;
pub mod indicators;
pub mod registry;
pub mod rsi_reversion;
pub mod sniper;
pub mod spot;

pub use registry::StrategyRegistry;

use common::{Candle, PositionSnapshot, TradeSignal};

/// One candle annotated with its computed feature vector and the strategy's
/// decision at that candle.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub candle: Candle,
    /// Aligned with [`Strategy::features`].
    pub values: Vec<f64>,
    pub signal: TradeSignal,
}

/// Output of running a strategy over a candle window. Rows cover only the
/// candles with a complete feature vector (warm-up candles are dropped).
#[derive(Debug, Clone, Default)]
pub struct StrategyFrame {
    pub features: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl StrategyFrame {
    pub fn latest(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    /// Decision on the last closed candle; `Wait` when nothing computed.
    pub fn last_signal(&self) -> TradeSignal {
        self.rows.last().map(|r| r.signal).unwrap_or(TradeSignal::Wait)
    }
}

/// Extra context passed to the intra-bar tick hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickContext {
    pub prev_price: Option<f64>,
}

/// A trading strategy: a deterministic feature computer plus a signal rule.
///
/// The classifier maps integer class ids to strategy positions in the
/// registry's alphabetical order, so names must be stable.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ordered feature column names produced by `apply`.
    fn features(&self) -> &'static [&'static str];

    /// Compute features and a signal per candle over the window (oldest
    /// first). `position` lets state-dependent strategies see the bot's open
    /// position.
    fn apply(&self, candles: &[Candle], position: Option<&PositionSnapshot>) -> StrategyFrame;

    /// Cheap intra-bar hook. The default detects percentage price spikes;
    /// strategies holding a position never flip here.
    fn on_price_tick(
        &self,
        price: f64,
        position: Option<&PositionSnapshot>,
        ctx: &TickContext,
    ) -> TradeSignal {
        if price <= 0.0 {
            return TradeSignal::Wait;
        }
        let prev = match ctx.prev_price {
            Some(p) if p > 0.0 => p,
            _ => return TradeSignal::Wait,
        };
        if position.map(|p| !p.is_flat()).unwrap_or(false) {
            return TradeSignal::Wait;
        }

        let change = (price - prev) / prev;
        let spike = self.tick_spike_pct() / 100.0;
        if change >= spike {
            TradeSignal::Buy
        } else if change <= -spike {
            TradeSignal::Sell
        } else {
            TradeSignal::Wait
        }
    }

    /// Spike threshold (percent) for the default tick hook.
    fn tick_spike_pct(&self) -> f64 {
        0.8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Strategy for Plain {
        fn name(&self) -> &'static str {
            "Plain"
        }
        fn features(&self) -> &'static [&'static str] {
            &[]
        }
        fn apply(&self, _: &[Candle], _: Option<&PositionSnapshot>) -> StrategyFrame {
            StrategyFrame::default()
        }
    }

    #[test]
    fn default_tick_hook_fires_on_spikes() {
        let s = Plain;
        let ctx = TickContext { prev_price: Some(100.0) };
        assert_eq!(s.on_price_tick(101.0, None, &ctx), TradeSignal::Buy);
        assert_eq!(s.on_price_tick(99.0, None, &ctx), TradeSignal::Sell);
        assert_eq!(s.on_price_tick(100.1, None, &ctx), TradeSignal::Wait);
    }

    #[test]
    fn default_tick_hook_never_flips_while_holding() {
        let s = Plain;
        let ctx = TickContext { prev_price: Some(100.0) };
        let pos = PositionSnapshot { qty: 1.0, avg_price: 100.0 };
        assert_eq!(s.on_price_tick(105.0, Some(&pos), &ctx), TradeSignal::Wait);
    }

    #[test]
    fn default_tick_hook_waits_without_context() {
        let s = Plain;
        assert_eq!(
            s.on_price_tick(100.0, None, &TickContext::default()),
            TradeSignal::Wait
        );
    }
}

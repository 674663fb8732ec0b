mod rsi_reversion;
mod trend_ema;
mod volatility_breakout;

pub use rsi_reversion::RsiReversion;
pub use trend_ema::TrendEma;
pub use volatility_breakout::VolatilityBreakout;

use std::sync::Arc;

use crate::Strategy;

/// Spot-market strategy set. Registered on top of the root set; duplicate
/// names here shadow the root implementation.
pub fn all() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(RsiReversion::default()),
        Arc::new(TrendEma::default()),
        Arc::new(VolatilityBreakout::default()),
    ]
}

mod rsi_reversion;
mod trend_ema;

pub use rsi_reversion::RsiReversion;
pub use trend_ema::TrendEma;

use std::sync::Arc;

use crate::Strategy;

/// Futures-market strategy set; tuned tighter than spot since positions can
/// be levered. Duplicate names shadow the root set.
pub fn all() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(RsiReversion::default()),
        Arc::new(TrendEma::default()),
    ]
}

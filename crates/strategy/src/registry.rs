use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use common::MarketKind;

use crate::{futures, rsi_reversion, sniper, spot, Strategy};

/// Holds every known strategy, resolved per market.
///
/// The root set is available to all markets; the `spot` and `futures` sets
/// are layered on top for their market, shadowing root strategies with the
/// same name. The per-market listing is alphabetical by strategy name: the
/// ML classifier maps integer class ids to positions in that order, so the
/// ordering must stay deterministic across restarts.
pub struct StrategyRegistry {
    root: Vec<Arc<dyn Strategy>>,
    spot: Vec<Arc<dyn Strategy>>,
    futures: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Registry over the built-in strategy sets.
    pub fn builtin() -> Self {
        let registry = Self {
            root: vec![
                Arc::new(rsi_reversion::RsiReversion::default()) as Arc<dyn Strategy>,
                Arc::new(sniper::Sniper::default()),
            ],
            spot: spot::all(),
            futures: futures::all(),
        };
        for kind in [MarketKind::Spot, MarketKind::Futures, MarketKind::Dex] {
            info!(
                market = %kind,
                strategies = ?registry.names(kind),
                "Strategy registry loaded"
            );
        }
        registry
    }

    fn market_set(&self, kind: MarketKind) -> &[Arc<dyn Strategy>] {
        match kind {
            MarketKind::Spot => &self.spot,
            MarketKind::Futures => &self.futures,
            MarketKind::Dex => &[],
        }
    }

    /// Strategies visible on `kind`, alphabetical by name, market-specific
    /// implementations shadowing root ones.
    pub fn for_market(&self, kind: MarketKind) -> Vec<Arc<dyn Strategy>> {
        let mut by_name: BTreeMap<&'static str, Arc<dyn Strategy>> = BTreeMap::new();
        for strategy in self.market_set(kind) {
            by_name.insert(strategy.name(), strategy.clone());
        }
        for strategy in &self.root {
            by_name.entry(strategy.name()).or_insert_with(|| strategy.clone());
        }
        by_name.into_values().collect()
    }

    pub fn names(&self, kind: MarketKind) -> Vec<&'static str> {
        self.for_market(kind).iter().map(|s| s.name()).collect()
    }

    pub fn get(&self, kind: MarketKind, name: &str) -> Option<Arc<dyn Strategy>> {
        self.for_market(kind)
            .into_iter()
            .find(|s| s.name() == name)
    }

    /// Position of `name` in the deterministic per-market ordering; this is
    /// the class id persisted ML models are trained against.
    pub fn class_id(&self, kind: MarketKind, name: &str) -> Option<usize> {
        self.for_market(kind).iter().position(|s| s.name() == name)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

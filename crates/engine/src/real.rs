use std::sync::Arc;

use tracing::{error, info};

use common::{ExchangeAdapter, Result, Side};
use store::BotInstance;

use crate::simulated::FillSummary;
use crate::TradeAction;

/// Outcome of a real-exchange execution attempt. A failed order aborts the
/// remaining legs; a flip whose close leg filled but whose open leg failed
/// reports the realized PnL so the engine can reconcile the bot to flat.
pub(crate) enum RealOutcome {
    Filled(FillSummary),
    Failed {
        reason: String,
        /// Set when the flip's closing leg filled before the failure.
        closed_leg_pnl: Option<f64>,
    },
}

/// Live executor: submits market orders through the user's exchange
/// instance. Position documents stay with the simulated ledger; the live
/// source of truth is the exchange account itself.
pub(crate) struct RealExecutor {
    pub adapter: Arc<dyn ExchangeAdapter>,
}

impl RealExecutor {
    pub async fn execute(
        &self,
        bot: &BotInstance,
        action: TradeAction,
        side: Side,
        price: f64,
        amount: f64,
    ) -> Result<RealOutcome> {
        let mut realized_pnl = 0.0;
        let mut closed_leg = false;

        // FLIP: first flatten the opposite position with a market order.
        if action == TradeAction::Flip && bot.position_qty > 0.0 {
            let close_side = bot.side.map(Side::opposite).unwrap_or(side);
            info!(
                bot = %bot.id, symbol = %bot.symbol, qty = bot.position_qty, side = %close_side,
                "Submitting flip-close order"
            );
            match self
                .adapter
                .create_order(&bot.symbol, close_side, bot.position_qty, None)
                .await
            {
                Ok(fill) => {
                    let close_px = if fill.avg_fill_price > 0.0 {
                        fill.avg_fill_price
                    } else {
                        price
                    };
                    realized_pnl = match bot.side {
                        Some(Side::Buy) => (close_px - bot.position_avg_price) * bot.position_qty,
                        Some(Side::Sell) => (bot.position_avg_price - close_px) * bot.position_qty,
                        None => 0.0,
                    };
                    closed_leg = true;
                }
                Err(e) => {
                    error!(bot = %bot.id, error = %e, "Flip close failed");
                    return Ok(RealOutcome::Failed {
                        reason: format!("flip close failed: {e}"),
                        closed_leg_pnl: None,
                    });
                }
            }
        }

        // Open (or add to) the target side.
        let qty_to_open = amount / price;
        let fill = match self
            .adapter
            .create_order(&bot.symbol, side, qty_to_open, None)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                error!(bot = %bot.id, error = %e, "Open order failed");
                return Ok(RealOutcome::Failed {
                    reason: format!("open failed: {e}"),
                    closed_leg_pnl: closed_leg.then_some(realized_pnl),
                });
            }
        };

        let fill_price = if fill.avg_fill_price > 0.0 {
            fill.avg_fill_price
        } else {
            price
        };
        let mut new_qty = if fill.filled_qty > 0.0 {
            fill.filled_qty
        } else {
            qty_to_open
        };
        let mut new_avg = fill_price;

        // DCA averages the fill into the held position.
        if action == TradeAction::Dca {
            let held_qty = bot.position_qty;
            let held_avg = bot.position_avg_price;
            let total_cost = held_qty * held_avg + new_qty * new_avg;
            new_qty += held_qty;
            if new_qty > 0.0 {
                new_avg = total_cost / new_qty;
            }
        }

        Ok(RealOutcome::Filled(FillSummary {
            fill_price,
            qty_executed: fill.filled_qty.max(qty_to_open),
            new_qty,
            new_avg,
            realized_pnl,
            roi: 0.0,
            capital_returned: 0.0,
        }))
    }

    /// Close `qty` of the live position with a market order.
    pub async fn reduce(
        &self,
        bot: &BotInstance,
        price: f64,
        qty: f64,
    ) -> Result<RealOutcome> {
        let close_side = bot.side.map(Side::opposite).ok_or_else(|| {
            common::Error::Validation("no open position to reduce".into())
        })?;

        let fill = match self
            .adapter
            .create_order(&bot.symbol, close_side, qty, None)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                return Ok(RealOutcome::Failed {
                    reason: format!("close failed: {e}"),
                    closed_leg_pnl: None,
                })
            }
        };

        let close_px = if fill.avg_fill_price > 0.0 {
            fill.avg_fill_price
        } else {
            price
        };
        let pnl = match bot.side {
            Some(Side::Buy) => (close_px - bot.position_avg_price) * qty,
            Some(Side::Sell) => (bot.position_avg_price - close_px) * qty,
            None => 0.0,
        };

        Ok(RealOutcome::Filled(FillSummary {
            fill_price: close_px,
            qty_executed: qty,
            new_qty: (bot.position_qty - qty).max(0.0),
            new_avg: bot.position_avg_price,
            realized_pnl: pnl,
            roi: 0.0,
            capital_returned: 0.0,
        }))
    }
}

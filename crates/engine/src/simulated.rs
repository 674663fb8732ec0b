use chrono::Utc;

use common::{quote_currency, PositionStatus, Result, Side};
use store::positions::new_open_position;
use store::{BotInstance, Store};

use crate::ledger::VirtualLedger;
use crate::TradeAction;

/// Net effect of one executed leg on the bot's position.
#[derive(Debug, Clone)]
pub struct FillSummary {
    pub fill_price: f64,
    pub qty_executed: f64,
    pub new_qty: f64,
    pub new_avg: f64,
    pub realized_pnl: f64,
    pub roi: f64,
    /// Quote credited back to the balance by closing legs.
    pub capital_returned: f64,
}

/// Paper executor: fills at the signal price and mutates the virtual ledger
/// and the canonical position document. Never touches a real exchange.
///
/// `ledger: None` funds the execution from the bot's sub-wallet instead of
/// the user's global balance; the engine books the sub-wallet delta from the
/// returned summary.
pub(crate) struct SimulatedExecutor<'a> {
    pub store: &'a Store,
    pub ledger: Option<&'a VirtualLedger>,
}

impl SimulatedExecutor<'_> {
    /// OPEN / DCA / FLIP at `price` with `amount` quote.
    ///
    /// FLIP closes the old position at `price`, credits
    /// `oldQty·oldAvg + realizedPnl` back to the quote balance, then opens
    /// the opposite side. The new side's `amount` is debited up front in
    /// every action.
    pub async fn execute(
        &self,
        bot: &BotInstance,
        action: TradeAction,
        side: Side,
        price: f64,
        amount: f64,
    ) -> Result<FillSummary> {
        let qty_executed = amount / price;
        let market = bot.canonical_market();
        let quote = quote_currency(&bot.symbol).to_string();

        if let Some(ledger) = self.ledger {
            ledger.add(&bot.user_id, market, &quote, -amount).await?;
        }

        let mut position = match self.store.open_position(&bot.id).await? {
            Some(position) => position,
            None => {
                let position = new_open_position(&bot.id, &bot.user_id, &bot.symbol, side);
                self.store.insert_position(&position).await?;
                position
            }
        };

        let mut realized_pnl = 0.0;
        let mut capital_returned = 0.0;

        if action == TradeAction::Flip && position.current_qty > 0.0 {
            let prev_qty = position.current_qty;
            let prev_avg = position.avg_entry_price;
            let flip_pnl = match position.side {
                Side::Buy => (price - prev_avg) * prev_qty,
                Side::Sell => (prev_avg - price) * prev_qty,
            };
            capital_returned = prev_qty * prev_avg + flip_pnl;
            if let Some(ledger) = self.ledger {
                ledger
                    .add(&bot.user_id, market, &quote, capital_returned)
                    .await?;
            }
            self.store
                .close_position(&position.id, flip_pnl, price)
                .await?;
            realized_pnl = flip_pnl;

            position = new_open_position(&bot.id, &bot.user_id, &bot.symbol, side);
            self.store.insert_position(&position).await?;
        }

        let prev_qty = position.current_qty;
        let prev_avg = position.avg_entry_price;
        let new_qty = prev_qty + qty_executed;
        let total_cost = prev_qty * prev_avg + qty_executed * price;
        let new_avg = if new_qty > 0.0 { total_cost / new_qty } else { price };

        position.side = side;
        position.current_qty = new_qty;
        position.avg_entry_price = new_avg;
        position.invested_amount = total_cost;
        position.total_trades += 1;
        position.roi = roi_pct(side, price, new_avg);
        self.store.update_position(&position).await?;

        Ok(FillSummary {
            fill_price: price,
            qty_executed,
            new_qty,
            new_avg,
            realized_pnl,
            roi: position.roi,
            capital_returned,
        })
    }

    /// Close `qty_to_close` of the open position at `price`, crediting the
    /// freed capital plus PnL. Reaching zero closes the position document.
    pub async fn reduce(
        &self,
        bot: &BotInstance,
        price: f64,
        qty_to_close: f64,
    ) -> Result<FillSummary> {
        let mut position = self
            .store
            .open_position(&bot.id)
            .await?
            .ok_or_else(|| common::Error::Validation("no open position to reduce".into()))?;

        let qty = qty_to_close.min(position.current_qty);
        if qty <= 0.0 {
            return Err(common::Error::Validation("nothing to close".into()));
        }

        let prev_avg = position.avg_entry_price;
        let pnl = match position.side {
            Side::Buy => (price - prev_avg) * qty,
            Side::Sell => (prev_avg - price) * qty,
        };
        let capital_returned = qty * prev_avg + pnl;

        let market = bot.canonical_market();
        let quote = quote_currency(&bot.symbol).to_string();
        if let Some(ledger) = self.ledger {
            ledger
                .add(&bot.user_id, market, &quote, capital_returned)
                .await?;
        }

        position.realized_pnl += pnl;
        position.current_qty = (position.current_qty - qty).max(0.0);
        position.invested_amount = position.current_qty * prev_avg;
        position.roi = roi_pct(position.side, price, prev_avg);
        if position.current_qty <= 1e-9 {
            position.current_qty = 0.0;
            position.status = PositionStatus::Closed;
            position.final_pnl = Some(position.realized_pnl);
            position.exit_price = Some(price);
            position.closed_at = Some(Utc::now());
        }
        self.store.update_position(&position).await?;

        Ok(FillSummary {
            fill_price: price,
            qty_executed: qty,
            new_qty: position.current_qty,
            new_avg: prev_avg,
            realized_pnl: pnl,
            roi: position.roi,
            capital_returned,
        })
    }
}

fn roi_pct(side: Side, price: f64, avg: f64) -> f64 {
    if avg <= 0.0 {
        return 0.0;
    }
    match side {
        Side::Buy => (price - avg) / avg * 100.0,
        Side::Sell => (avg - price) / avg * 100.0,
    }
}

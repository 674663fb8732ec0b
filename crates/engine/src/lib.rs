pub mod ledger;
pub mod locks;
mod real;
mod simulated;

pub use ledger::VirtualLedger;
pub use locks::BotLocks;
pub use simulated::FillSummary;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{
    quote_currency, BotStatus, Error, ExchangeAdapter, Result, Side, SignalData, TradeMode,
};
use exchange::normalize_symbol;
use exchange::ExchangeHub;
use notify::{bot_topic, NotificationBus, UserEvent};
use store::{AppConfig, BotInstance, BotWalletPolicy, Store, TradeRow};

use real::{RealExecutor, RealOutcome};
use simulated::SimulatedExecutor;

/// Reject automatic flips whose unrealized PnL is below this percent.
/// Compiled-in on purpose: there is no per-user knob.
pub const PROFIT_GUARD_PCT: f64 = -0.5;

/// How a signal lands on the bot's current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Open,
    Dca,
    Flip,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::Open => write!(f, "OPEN"),
            TradeAction::Dca => write!(f, "DCA"),
            TradeAction::Flip => write!(f, "FLIP"),
        }
    }
}

/// Why an execution was refused. No state is mutated on a blocked signal.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    BotInactive,
    NoActionableSignal,
    UnknownSymbol,
    InsufficientBalance,
    ProfitGuard,
    Auth(String),
    OrderFailed(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::BotInactive => write!(f, "bot_inactive"),
            BlockReason::NoActionableSignal => write!(f, "no_actionable_signal"),
            BlockReason::UnknownSymbol => write!(f, "unknown_symbol"),
            BlockReason::InsufficientBalance => write!(f, "insufficient_balance"),
            BlockReason::ProfitGuard => write!(f, "profit_guard"),
            BlockReason::Auth(msg) => write!(f, "auth: {msg}"),
            BlockReason::OrderFailed(msg) => write!(f, "order_failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub trade_id: String,
    pub action: TradeAction,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub roi: f64,
}

#[derive(Debug, Clone)]
pub enum Execution {
    Executed(ExecutionReport),
    Blocked { reason: BlockReason },
}

impl Execution {
    pub fn is_executed(&self) -> bool {
        matches!(self, Execution::Executed(_))
    }

    fn blocked(reason: BlockReason) -> Self {
        Execution::Blocked { reason }
    }
}

/// Best-effort out-of-band alert channel (telegram). Failures never affect
/// the execution result.
#[async_trait]
pub trait TradeAlerter: Send + Sync {
    async fn trade_alert(&self, user_id: &str, trade: &TradeRow);
}

enum Executor<'a> {
    Simulated(SimulatedExecutor<'a>),
    Real(RealExecutor),
}

/// The signal-execution core: balance gating, OPEN/DCA/FLIP state machine,
/// profit guard, PnL bookkeeping and ledger mutation.
///
/// One signal executes at a time per bot; bots run concurrently. This is the
/// only component allowed to mutate virtual balances at runtime.
pub struct ExecutionEngine {
    store: Store,
    hub: Arc<ExchangeHub>,
    bus: Arc<NotificationBus>,
    ledger: VirtualLedger,
    locks: BotLocks,
    alerter: OnceLock<Arc<dyn TradeAlerter>>,
}

impl ExecutionEngine {
    pub fn new(store: Store, hub: Arc<ExchangeHub>, bus: Arc<NotificationBus>) -> Self {
        let ledger = VirtualLedger::new(store.clone(), bus.clone());
        Self {
            store,
            hub,
            bus,
            ledger,
            locks: BotLocks::default(),
            alerter: OnceLock::new(),
        }
    }

    pub fn ledger(&self) -> &VirtualLedger {
        &self.ledger
    }

    pub fn set_alerter(&self, alerter: Arc<dyn TradeAlerter>) {
        let _ = self.alerter.set(alerter);
    }

    /// Process one signal for one bot. Serialized per bot; the balance gate
    /// and the position mutation are atomic with respect to any concurrent
    /// signal for the same bot.
    pub async fn process_signal(&self, bot_id: &str, data: SignalData) -> Result<Execution> {
        let _guard = self.locks.acquire(bot_id).await;
        self.process_locked(bot_id, data).await
    }

    async fn process_locked(&self, bot_id: &str, data: SignalData) -> Result<Execution> {
        let bot = self
            .store
            .bot(bot_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("unknown bot {bot_id}")))?;

        if bot.status != BotStatus::Active {
            return Ok(Execution::blocked(BlockReason::BotInactive));
        }
        let Some(side) = data.signal.side() else {
            return Ok(Execution::blocked(BlockReason::NoActionableSignal));
        };
        if normalize_symbol(&bot.symbol).starts_with("UNKNOWN/") {
            return Ok(Execution::blocked(BlockReason::UnknownSymbol));
        }
        if data.price <= 0.0 {
            return Err(Error::Validation(format!("bad signal price {}", data.price)));
        }

        let price = data.price;
        let amount = if bot.amount > 0.0 { bot.amount } else { 100.0 };
        let quote = quote_currency(&bot.symbol).to_string();
        let config = self.store.app_config(&bot.user_id).await?;

        // ── Balance gate ─────────────────────────────────────────────────────
        let mut real_adapter: Option<Arc<dyn ExchangeAdapter>> = None;
        match bot.mode {
            TradeMode::Simulated => {
                let available = if bot.wallet_allocated > 0.0 {
                    bot.wallet_available
                } else {
                    let bootstrap = config.virtual_balances.for_market(bot.canonical_market());
                    match self
                        .ledger
                        .available(&bot.user_id, bot.canonical_market(), &quote, Some(bootstrap))
                        .await
                    {
                        Ok(available) => available,
                        Err(e) => {
                            // Demo accounts fail open on a balance read error.
                            warn!(bot = %bot.id, error = %e, "Virtual balance unreadable, allowing demo trade");
                            amount
                        }
                    }
                };
                info!(bot = %bot.id, quote = %quote, available, required = amount, "Balance gate (simulated)");
                if available < amount {
                    warn!(bot = %bot.id, available, required = amount, "Insufficient virtual balance");
                    return Ok(Execution::blocked(BlockReason::InsufficientBalance));
                }
            }
            TradeMode::Real => {
                let adapter = match self
                    .hub
                    .for_user(&bot.user_id, &bot.exchange_id, bot.market_type)
                    .await
                {
                    Ok(adapter) => adapter,
                    Err(Error::Auth(msg)) => return Ok(Execution::blocked(BlockReason::Auth(msg))),
                    Err(e) => return Err(e),
                };
                // Real funds fail closed: no readable balance, no trade.
                let free = match adapter.fetch_balance().await {
                    Ok(balances) => balances
                        .iter()
                        .find(|b| b.asset == quote)
                        .map(|b| b.free)
                        .unwrap_or(0.0),
                    Err(Error::Auth(msg)) => {
                        return Ok(Execution::blocked(BlockReason::Auth(msg)))
                    }
                    Err(e) => {
                        error!(bot = %bot.id, error = %e, "Real balance check failed");
                        return Ok(Execution::blocked(BlockReason::InsufficientBalance));
                    }
                };
                info!(bot = %bot.id, quote = %quote, free, required = amount, "Balance gate (real)");
                if free < amount {
                    return Ok(Execution::blocked(BlockReason::InsufficientBalance));
                }
                real_adapter = Some(adapter);
            }
        }

        // ── Action classification ────────────────────────────────────────────
        let action = if bot.position_qty <= 0.0 {
            TradeAction::Open
        } else if bot.side == Some(side) {
            TradeAction::Dca
        } else {
            TradeAction::Flip
        };

        // ── Profit guard ─────────────────────────────────────────────────────
        if !data.is_alert && action == TradeAction::Flip {
            let pnl_pct = unrealized_pnl_pct(&bot, price);
            if pnl_pct < PROFIT_GUARD_PCT {
                warn!(
                    bot = %bot.id, from = ?bot.side, to = %side, pnl_pct,
                    "Profit guard blocked flip into a loss"
                );
                return Ok(Execution::blocked(BlockReason::ProfitGuard));
            }
        }

        info!(bot = %bot.id, symbol = %bot.symbol, mode = %bot.mode, action = %action, side = %side, price, "Engine executing");

        // ── Execute ──────────────────────────────────────────────────────────
        let funding_ledger = (bot.wallet_allocated <= 0.0).then_some(&self.ledger);
        let executor = match bot.mode {
            TradeMode::Simulated => Executor::Simulated(SimulatedExecutor {
                store: &self.store,
                ledger: funding_ledger,
            }),
            TradeMode::Real => Executor::Real(RealExecutor {
                adapter: real_adapter.expect("adapter resolved by the balance gate"),
            }),
        };

        let summary = match &executor {
            Executor::Simulated(exec) => exec.execute(&bot, action, side, price, amount).await?,
            Executor::Real(exec) => match exec.execute(&bot, action, side, price, amount).await? {
                RealOutcome::Filled(summary) => summary,
                RealOutcome::Failed { reason, closed_leg_pnl } => {
                    if let Some(pnl) = closed_leg_pnl {
                        // The closing leg filled before the failure: reconcile
                        // the bot to flat so the books match the exchange.
                        self.store
                            .update_bot_after_execution(&bot.id, None, 0.0, 0.0, pnl)
                            .await?;
                    }
                    return Ok(Execution::blocked(BlockReason::OrderFailed(reason)));
                }
            },
        };

        // ── Sub-wallet booking (simulated only) ──────────────────────────────
        // Principal returns to the sub-wallet; realized PnL accumulates
        // separately and reaches the global balance only on bot deletion.
        if bot.mode == TradeMode::Simulated && bot.wallet_allocated > 0.0 {
            let principal_returned = summary.capital_returned - summary.realized_pnl;
            let available = bot.wallet_available - amount + principal_returned;
            let realized = bot.wallet_realized_pnl + summary.realized_pnl;
            self.store
                .set_bot_wallet(&bot.id, bot.wallet_allocated, available, realized)
                .await?;
        }

        // ── Persist ──────────────────────────────────────────────────────────
        let trade = TradeRow {
            id: Uuid::new_v4().to_string(),
            bot_id: bot.id.clone(),
            user_id: bot.user_id.clone(),
            symbol: bot.symbol.clone(),
            side,
            price: summary.fill_price,
            amount,
            pnl: summary.realized_pnl,
            mode: bot.mode,
            ts: Utc::now(),
        };
        self.store.insert_trade(&trade).await?;
        self.store
            .update_bot_after_execution(&bot.id, Some(side), summary.new_qty, summary.new_avg, summary.realized_pnl)
            .await?;

        // Audit row for the decision itself, independent of the trade row.
        let source = format!("AUTO_{}", bot.strategy_name.to_uppercase());
        let raw = format!("Signal {:?} @ {price}", data.signal);
        if let Err(e) = self
            .store
            .insert_auto_signal(&bot.user_id, &source, &raw, &bot.symbol, &side.to_string(), data.confidence)
            .await
        {
            error!(bot = %bot.id, error = %e, "Failed persisting signal audit row");
        }

        // ── Invariant check ──────────────────────────────────────────────────
        if bot.mode == TradeMode::Simulated && bot.wallet_allocated <= 0.0 {
            let balance = self
                .ledger
                .available(&bot.user_id, bot.canonical_market(), &quote, None)
                .await?;
            if balance < -1e-6 {
                error!(
                    bot = %bot.id, user = %bot.user_id, balance, action = %action,
                    price, amount, "Negative virtual balance after completed trade — pausing bot"
                );
                self.store.set_bot_status(&bot.id, BotStatus::Paused).await?;
            }
        }

        self.notify_execution(&bot, &trade, &summary, Some(side), price).await;

        Ok(Execution::Executed(ExecutionReport {
            trade_id: trade.id,
            action,
            side,
            price: summary.fill_price,
            amount,
            qty: summary.new_qty,
            avg_price: summary.new_avg,
            realized_pnl: summary.realized_pnl,
            roi: summary.roi,
        }))
    }

    async fn notify_execution(
        &self,
        bot: &BotInstance,
        trade: &TradeRow,
        summary: &FillSummary,
        position_side: Option<Side>,
        price: f64,
    ) {
        if let Ok(doc) = serde_json::to_value(trade) {
            self.bus
                .emit_to_user(&bot.user_id, &UserEvent::OperationUpdate(doc))
                .await;
        }

        let update = UserEvent::BotUpdate {
            id: bot.id.clone(),
            side: if summary.new_qty > 0.0 { position_side } else { None },
            position: common::PositionSnapshot {
                qty: summary.new_qty,
                avg_price: summary.new_avg,
            },
            pnl: bot.total_pnl + summary.realized_pnl,
            current_price: price,
        };
        self.bus.emit_to_user(&bot.user_id, &update).await;
        self.bus.emit_to_topic(&bot_topic(&bot.id), &update).await;

        if let Some(alerter) = self.alerter.get() {
            alerter.trade_alert(&bot.user_id, trade).await;
        }
    }

    // ── Manual actions ───────────────────────────────────────────────────────

    /// Force-exit to flat at `price`, crediting principal plus PnL.
    pub async fn manual_close(&self, user_id: &str, bot_id: &str, price: f64) -> Result<Execution> {
        self.close_fraction(user_id, bot_id, 100.0, price).await
    }

    /// Close `percent`% of the open position at `price`. Used directly by
    /// the telegram TP ladder.
    pub async fn close_fraction(
        &self,
        user_id: &str,
        bot_id: &str,
        percent: f64,
        price: f64,
    ) -> Result<Execution> {
        let _guard = self.locks.acquire(bot_id).await;

        let bot = self.owned_bot(user_id, bot_id).await?;
        if bot.is_flat() {
            return Err(Error::Validation("no open position to close".into()));
        }
        if !(0.0..=100.0).contains(&percent) || percent <= 0.0 {
            return Err(Error::Validation(format!("bad close percent {percent}")));
        }
        let qty = bot.position_qty * percent / 100.0;

        let summary = match bot.mode {
            TradeMode::Simulated => {
                let exec = SimulatedExecutor {
                    store: &self.store,
                    ledger: (bot.wallet_allocated <= 0.0).then_some(&self.ledger),
                };
                exec.reduce(&bot, price, qty).await?
            }
            TradeMode::Real => {
                let adapter = match self
                    .hub
                    .for_user(&bot.user_id, &bot.exchange_id, bot.market_type)
                    .await
                {
                    Ok(adapter) => adapter,
                    Err(Error::Auth(msg)) => return Ok(Execution::blocked(BlockReason::Auth(msg))),
                    Err(e) => return Err(e),
                };
                match (RealExecutor { adapter }).reduce(&bot, price, qty).await? {
                    RealOutcome::Filled(summary) => summary,
                    RealOutcome::Failed { reason, .. } => {
                        return Ok(Execution::blocked(BlockReason::OrderFailed(reason)))
                    }
                }
            }
        };

        if bot.mode == TradeMode::Simulated && bot.wallet_allocated > 0.0 {
            let principal_returned = summary.capital_returned - summary.realized_pnl;
            let available = bot.wallet_available + principal_returned;
            let realized = bot.wallet_realized_pnl + summary.realized_pnl;
            self.store
                .set_bot_wallet(&bot.id, bot.wallet_allocated, available, realized)
                .await?;
        }

        let close_side = bot.side.map(Side::opposite).unwrap_or(Side::Sell);
        let trade = TradeRow {
            id: Uuid::new_v4().to_string(),
            bot_id: bot.id.clone(),
            user_id: bot.user_id.clone(),
            symbol: bot.symbol.clone(),
            side: close_side,
            price: summary.fill_price,
            amount: summary.qty_executed * summary.new_avg,
            pnl: summary.realized_pnl,
            mode: bot.mode,
            ts: Utc::now(),
        };
        self.store.insert_trade(&trade).await?;

        let remaining_side = if summary.new_qty > 0.0 { bot.side } else { None };
        self.store
            .update_bot_after_execution(&bot.id, remaining_side, summary.new_qty, if summary.new_qty > 0.0 { summary.new_avg } else { 0.0 }, summary.realized_pnl)
            .await?;

        self.notify_execution(&bot, &trade, &summary, remaining_side, price).await;

        Ok(Execution::Executed(ExecutionReport {
            trade_id: trade.id,
            action: TradeAction::Flip,
            side: close_side,
            price: summary.fill_price,
            amount: trade.amount,
            qty: summary.new_qty,
            avg_price: summary.new_avg,
            realized_pnl: summary.realized_pnl,
            roi: summary.roi,
        }))
    }

    /// Explicit DCA on the current side at `price`.
    pub async fn manual_increase(
        &self,
        user_id: &str,
        bot_id: &str,
        price: f64,
    ) -> Result<Execution> {
        let bot = self.owned_bot(user_id, bot_id).await?;
        let signal = match bot.side {
            Some(Side::Buy) => common::TradeSignal::Buy,
            Some(Side::Sell) => common::TradeSignal::Sell,
            None => return Err(Error::Validation("no open position to increase".into())),
        };
        self.process_signal(bot_id, SignalData::alert(signal, price)).await
    }

    /// Force a FLIP to the opposite side, bypassing the profit guard.
    pub async fn manual_reverse(
        &self,
        user_id: &str,
        bot_id: &str,
        price: f64,
    ) -> Result<Execution> {
        let bot = self.owned_bot(user_id, bot_id).await?;
        let signal = match bot.side {
            Some(Side::Buy) => common::TradeSignal::Sell,
            Some(Side::Sell) => common::TradeSignal::Buy,
            None => return Err(Error::Validation("no open position to reverse".into())),
        };
        self.process_signal(bot_id, SignalData::alert(signal, price)).await
    }

    async fn owned_bot(&self, user_id: &str, bot_id: &str) -> Result<BotInstance> {
        let bot = self
            .store
            .bot(bot_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("unknown bot {bot_id}")))?;
        if bot.user_id != user_id {
            return Err(Error::Validation("bot belongs to another user".into()));
        }
        Ok(bot)
    }

    // ── Bot lifecycle ────────────────────────────────────────────────────────

    /// Validate limits, persist the bot, carve out its sub-wallet when the
    /// policy asks for one, and announce it.
    pub async fn activate_bot(&self, bot: BotInstance, config: &AppConfig) -> Result<BotInstance> {
        if bot.amount <= 0.0 {
            return Err(Error::Validation("bot amount must be positive".into()));
        }
        if let Some(max) = config.investment_limits.max_for(bot.canonical_market()) {
            if bot.amount > max {
                return Err(Error::Validation(format!(
                    "amount {} exceeds the {} investment limit {max}",
                    bot.amount,
                    bot.canonical_market()
                )));
            }
        }
        let active = self.store.count_active_bots(&bot.user_id).await?;
        if active >= config.bot_strategy.max_active_bots as i64 {
            return Err(Error::Validation(format!(
                "max active bots reached ({})",
                config.bot_strategy.max_active_bots
            )));
        }

        self.store.create_bot(&bot).await?;
        self.allocate_sub_wallet(&bot, &config.bot_wallet_policy).await?;

        let bot = self
            .store
            .bot(&bot.id)
            .await?
            .ok_or_else(|| Error::Other("bot missing after create".into()))?;
        if let Ok(doc) = serde_json::to_value(&bot) {
            self.bus
                .emit_to_user(&bot.user_id, &UserEvent::BotCreated(doc))
                .await;
        }
        Ok(bot)
    }

    /// Move `clamp(globalUSDT · pct, min, max)` from the user's global quote
    /// balance into the bot's sub-wallet. Simulated mode only.
    pub async fn allocate_sub_wallet(
        &self,
        bot: &BotInstance,
        policy: &BotWalletPolicy,
    ) -> Result<f64> {
        if bot.mode != TradeMode::Simulated || !policy.enabled {
            return Ok(0.0);
        }
        let market = bot.canonical_market();
        let global = self
            .ledger
            .available(&bot.user_id, market, "USDT", None)
            .await?;

        let mut allocated = if policy.per_bot_allocation_pct > 0.0 {
            global * policy.per_bot_allocation_pct / 100.0
        } else {
            0.0
        };
        if policy.min_allocation_usdt > 0.0 {
            allocated = allocated.max(policy.min_allocation_usdt);
        }
        if policy.max_allocation_usdt > 0.0 {
            allocated = allocated.min(policy.max_allocation_usdt);
        }
        allocated = allocated.clamp(0.0, global);

        if allocated > 0.0 {
            self.ledger
                .add(&bot.user_id, market, "USDT", -allocated)
                .await?;
            self.store
                .set_bot_wallet(&bot.id, allocated, allocated, 0.0)
                .await?;
            info!(bot = %bot.id, allocated, "Sub-wallet allocated");
        }
        Ok(allocated)
    }

    /// Delete a bot and its dependents, returning the sub-wallet funds (and
    /// their realized PnL) to the user's global balance.
    pub async fn delete_bot(&self, user_id: &str, bot_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(bot_id).await;
        let bot = self.owned_bot(user_id, bot_id).await?;

        let refund = bot.wallet_available + bot.wallet_realized_pnl;
        if bot.mode == TradeMode::Simulated && refund > 0.0 {
            self.ledger
                .add(&bot.user_id, bot.canonical_market(), "USDT", refund)
                .await?;
        }

        self.store.delete_bot_cascade(bot_id).await?;
        self.bus
            .emit_to_user(user_id, &UserEvent::BotDeleted { id: bot_id.to_string() })
            .await;
        Ok(())
    }
}

fn unrealized_pnl_pct(bot: &BotInstance, price: f64) -> f64 {
    let avg = bot.position_avg_price;
    if avg <= 0.0 {
        return 0.0;
    }
    match bot.side {
        Some(Side::Buy) => (price - avg) / avg * 100.0,
        Some(Side::Sell) => (avg - price) / avg * 100.0,
        None => 0.0,
    }
}

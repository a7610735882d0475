// =============================================================================
// Hedge Monitor — one evaluation cycle over every open position
// =============================================================================
//
// Per cycle:
//   1. Fetch nonzero positions and group them by symbol into {long, short}.
//   2. Reconcile the registry: legs that vanished from the exchange are
//      dropped, entries with no legs left are removed.
//   3. Per symbol, strictly in order:
//        both legs open -> hedge-mode evaluation (stop-loss / trailing)
//        one leg open   -> single-leg evaluation, only when the symbol is
//                          already registered (its partner was cut)
//   4. Publish a read-only registry snapshot for the control API.
//
// A failure while evaluating one symbol is logged and the cycle moves on.
// Once the aggregate controller has halted, a cycle does nothing at all.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::aggregate::AggregateController;
use super::closer::{CloseCallback, CloseRequest, LegCloser};
use super::pnl;
use super::registry::{HedgePosition, HedgeRegistry, HedgeView, Leg};
use super::tiers::{tier_label, TierTable, TrailOutcome};
use crate::config::BotConfig;
use crate::exchange::FuturesExchange;
use crate::notify::Notifier;
use crate::types::{PositionSnapshot, Side};

/// Registry view shared with the control API.
pub type HedgeSnapshot = Arc<RwLock<Vec<HedgeView>>>;

/// Evaluation parameters taken from configuration.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Loss (%) beyond which a leg is cut. Strictly-less-than comparison.
    pub stop_loss_pct: f64,
    pub min_monitor_delay: Duration,
    pub log_interval: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            stop_loss_pct: config.stop_loss.stop_loss_pct,
            min_monitor_delay: Duration::from_secs_f64(config.min_monitor_delay_secs),
            log_interval: Duration::from_secs_f64(config.log_interval_secs),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            stop_loss_pct: 1.0,
            min_monitor_delay: Duration::from_secs(5),
            log_interval: Duration::from_secs(5),
        }
    }
}

/// Positions observed for one symbol in the current snapshot.
#[derive(Debug, Default, Clone)]
struct Observed {
    long: Option<PositionSnapshot>,
    short: Option<PositionSnapshot>,
}

impl Observed {
    fn get(&self, side: Side) -> Option<&PositionSnapshot> {
        match side {
            Side::Long => self.long.as_ref(),
            Side::Short => self.short.as_ref(),
        }
    }
}

fn group_by_symbol(positions: Vec<PositionSnapshot>) -> BTreeMap<String, Observed> {
    let mut grouped: BTreeMap<String, Observed> = BTreeMap::new();
    for position in positions {
        let Some(side) = position.side() else {
            continue;
        };
        let entry = grouped.entry(position.symbol.clone()).or_default();
        match side {
            Side::Long => entry.long = Some(position),
            Side::Short => entry.short = Some(position),
        }
    }
    grouped
}

fn leg_profit_pct(side: Side, position: &PositionSnapshot, mark: Decimal) -> Result<f64> {
    pnl::profit_pct(side, position.entry_price, mark).ok_or_else(|| {
        anyhow!(
            "{} {} has non-positive entry price {}",
            position.symbol,
            side,
            position.entry_price
        )
    })
}

// =============================================================================
// HedgeMonitor
// =============================================================================

pub struct HedgeMonitor {
    exchange: Arc<dyn FuturesExchange>,
    aggregate: Arc<AggregateController>,
    closer: LegCloser,
    tiers: TierTable,
    settings: MonitorSettings,
    registry: HedgeRegistry,
    published: HedgeSnapshot,
}

impl HedgeMonitor {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        aggregate: Arc<AggregateController>,
        notifier: Arc<dyn Notifier>,
        tiers: TierTable,
        settings: MonitorSettings,
    ) -> Self {
        info!(
            stop_loss_pct = settings.stop_loss_pct,
            tiers = tiers.len(),
            min_delay_secs = settings.min_monitor_delay.as_secs_f64(),
            "HedgeMonitor initialised"
        );
        let closer = LegCloser::new(Arc::clone(&exchange), Arc::clone(&aggregate), notifier);
        Self {
            exchange,
            aggregate,
            closer,
            tiers,
            settings,
            registry: HedgeRegistry::new(),
            published: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a callback fired after every successful leg close.
    pub fn on_position_closed(&mut self, callback: CloseCallback) {
        self.closer.set_callback(callback);
    }

    pub fn snapshot_handle(&self) -> HedgeSnapshot {
        Arc::clone(&self.published)
    }

    pub fn registry(&self) -> &HedgeRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.aggregate.is_running()
    }

    /// Sets the shared running flag to false.
    pub fn stop(&self) {
        self.aggregate.stop();
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// Run one evaluation cycle.
    pub async fn monitor_positions(&mut self) -> Result<()> {
        self.monitor_positions_at(Instant::now()).await
    }

    /// Run one evaluation cycle against an explicit clock.
    pub async fn monitor_positions_at(&mut self, now: Instant) -> Result<()> {
        if !self.aggregate.is_running() {
            return Ok(());
        }

        let positions = self
            .exchange
            .fetch_positions()
            .await
            .context("failed to fetch positions")?;
        debug!(count = positions.len(), "positions fetched");

        let grouped = group_by_symbol(positions);
        self.reconcile(&grouped);

        for (symbol, observed) in &grouped {
            if !self.aggregate.is_running() {
                break;
            }

            let outcome = match (&observed.long, &observed.short) {
                (Some(long), Some(short)) => self.evaluate_hedge(symbol, long, short, now).await,
                (Some(only), None) | (None, Some(only)) => {
                    self.evaluate_single(symbol, only, now).await
                }
                (None, None) => Ok(()),
            };

            if let Err(e) = outcome {
                error!(symbol = %symbol, error = %e, "symbol evaluation failed — continuing");
            }
        }

        *self.published.write() = self.registry.snapshot(now);
        Ok(())
    }

    /// Drop registered legs that are no longer open on the exchange.
    fn reconcile(&mut self, grouped: &BTreeMap<String, Observed>) {
        for symbol in self.registry.symbols() {
            let Some(hedge) = self.registry.get_mut(&symbol) else {
                continue;
            };
            let observed = grouped.get(&symbol);

            for side in Side::BOTH {
                if hedge.leg(side).is_some() && observed.and_then(|o| o.get(side)).is_none() {
                    warn!(symbol = %symbol, %side, "registered leg closed outside the monitor — dropping it");
                    hedge.take_leg(side);
                }
            }

            if !hedge.has_open_legs() {
                info!(symbol = %symbol, "no open legs remain — registry entry removed");
                self.registry.remove(&symbol);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Hedge mode (both legs open)
    // -------------------------------------------------------------------------

    async fn evaluate_hedge(
        &mut self,
        symbol: &str,
        long: &PositionSnapshot,
        short: &PositionSnapshot,
        now: Instant,
    ) -> Result<()> {
        let Some(hedge) = self.registry.get_mut(symbol) else {
            self.registry.upsert(
                symbol,
                HedgePosition::opened(
                    Leg::new(long.entry_price, long.amount(), now),
                    Leg::new(short.entry_price, short.amount(), now),
                ),
            );
            info!(
                symbol,
                long_amount = %long.amount(),
                long_entry = %long.entry_price,
                short_amount = %short.amount(),
                short_entry = %short.entry_price,
                stop_loss_pct = self.settings.stop_loss_pct,
                "hedge position registered"
            );
            return Ok(());
        };

        // A side may reopen while its partner is still tracked.
        for (side, position) in [(Side::Long, long), (Side::Short, short)] {
            if hedge.leg(side).is_none() {
                info!(symbol, %side, "leg reopened — tracking it again");
                hedge.set_leg(side, Leg::new(position.entry_price, position.amount(), now));
            }
        }

        let too_young = Side::BOTH.iter().any(|&side| {
            hedge
                .leg(side)
                .is_some_and(|leg| leg.age(now) < self.settings.min_monitor_delay)
        });
        if too_young {
            debug!(symbol, "hedge opened too recently — skipping evaluation");
            return Ok(());
        }

        let mark = self.exchange.mark_price(symbol).await?;
        let long_pct = leg_profit_pct(Side::Long, long, mark)?;
        let short_pct = leg_profit_pct(Side::Short, short, mark)?;

        let Some(hedge) = self.registry.get_mut(symbol) else {
            return Ok(());
        };
        let mut highest_long = 0.0;
        let mut should_log = false;
        if let Some(leg) = hedge.leg_mut(Side::Long) {
            highest_long = leg.observe(long_pct);
            should_log = leg.should_log(now, self.settings.log_interval);
        }
        let highest_short = hedge
            .leg_mut(Side::Short)
            .map(|leg| leg.observe(short_pct))
            .unwrap_or_default();

        if should_log {
            info!(
                symbol,
                %mark,
                long_pct = format!("{long_pct:.3}"),
                long_highest = format!("{highest_long:.3}"),
                short_pct = format!("{short_pct:.3}"),
                short_highest = format!("{highest_short:.3}"),
                "monitoring hedge"
            );
        }

        let threshold = -self.settings.stop_loss_pct;
        let long_loss = long_pct < threshold;
        let short_loss = short_pct < threshold;

        match (long_loss, short_loss) {
            (true, false) | (false, true) => {
                let (loser, loser_pos, survivor) = if long_loss {
                    (Side::Long, long, Side::Short)
                } else {
                    (Side::Short, short, Side::Long)
                };
                info!(
                    symbol,
                    side = %loser,
                    stop_loss_pct = self.settings.stop_loss_pct,
                    "leg breached stop-loss — cutting it, partner moves to trailing stop"
                );
                self.close_leg(symbol, loser, loser_pos, mark, false).await;
                if !self.aggregate.is_running() {
                    return Ok(());
                }
                if self.registry.has_leg(symbol, survivor) {
                    self.enable_trailing(symbol, survivor);
                }
            }
            (true, true) => {
                warn!(
                    symbol,
                    stop_loss_pct = self.settings.stop_loss_pct,
                    "both legs breached stop-loss — cutting both"
                );
                self.close_leg(symbol, Side::Long, long, mark, false).await;
                if !self.aggregate.is_running() {
                    return Ok(());
                }
                self.close_leg(symbol, Side::Short, short, mark, false).await;
            }
            (false, false) if long_pct > 0.0 && short_pct > 0.0 => {
                self.check_trailing(symbol, Side::Long, long, long_pct, mark).await;
                if !self.aggregate.is_running() {
                    return Ok(());
                }
                self.check_trailing(symbol, Side::Short, short, short_pct, mark).await;
            }
            (false, false) => {}
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Single-leg mode (partner already cut)
    // -------------------------------------------------------------------------

    async fn evaluate_single(
        &mut self,
        symbol: &str,
        position: &PositionSnapshot,
        now: Instant,
    ) -> Result<()> {
        let side = position
            .side()
            .ok_or_else(|| anyhow!("{symbol} position has zero amount"))?;

        let Some(leg) = self
            .registry
            .get_mut(symbol)
            .and_then(|hedge| hedge.leg_mut(side))
        else {
            debug!(symbol, %side, "unpaired leg is not tracked — ignoring");
            return Ok(());
        };

        // Partial fills move the average entry; always follow the exchange.
        leg.entry_price = position.entry_price;
        leg.amount = position.amount();

        if leg.age(now) < self.settings.min_monitor_delay {
            debug!(symbol, %side, "leg opened too recently — skipping evaluation");
            return Ok(());
        }

        let mark = self.exchange.mark_price(symbol).await?;
        let profit_pct = leg_profit_pct(side, position, mark)?;

        let Some(leg) = self
            .registry
            .get_mut(symbol)
            .and_then(|hedge| hedge.leg_mut(side))
        else {
            return Ok(());
        };
        let highest = leg.observe(profit_pct);
        if leg.should_log(now, self.settings.log_interval) {
            info!(
                symbol,
                %side,
                %mark,
                profit_pct = format!("{profit_pct:.3}"),
                highest_pct = format!("{highest:.3}"),
                tier = %tier_label(leg.current_tier),
                "monitoring single leg"
            );
        }

        if profit_pct < -self.settings.stop_loss_pct {
            info!(
                symbol,
                %side,
                stop_loss_pct = self.settings.stop_loss_pct,
                "single leg breached stop-loss — cutting it"
            );
            self.close_leg(symbol, side, position, mark, false).await;
            return Ok(());
        }

        self.check_trailing(symbol, side, position, profit_pct, mark).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trailing stop
    // -------------------------------------------------------------------------

    /// Promote a surviving leg straight into trailing mode from its current
    /// high-water mark.
    fn enable_trailing(&mut self, symbol: &str, side: Side) {
        let Some(leg) = self
            .registry
            .get_mut(symbol)
            .and_then(|hedge| hedge.leg_mut(side))
        else {
            return;
        };
        leg.current_tier = self.tiers.promote(leg.current_tier, leg.highest_profit_pct);
        info!(
            symbol,
            %side,
            tier = %tier_label(leg.current_tier),
            highest_pct = format!("{:.3}", leg.highest_profit_pct),
            "leg entered trailing-stop mode"
        );
    }

    async fn check_trailing(
        &mut self,
        symbol: &str,
        side: Side,
        position: &PositionSnapshot,
        profit_pct: f64,
        mark: Decimal,
    ) {
        let Some(leg) = self
            .registry
            .get_mut(symbol)
            .and_then(|hedge| hedge.leg_mut(side))
        else {
            return;
        };

        let highest = leg.highest_profit_pct;
        match self.tiers.step(leg.current_tier, highest, profit_pct) {
            TrailOutcome::Close { tier, rule } => {
                info!(
                    symbol,
                    %side,
                    %tier,
                    rule = %rule,
                    highest_pct = format!("{highest:.3}"),
                    profit_pct = format!("{profit_pct:.3}"),
                    "trailing stop triggered — closing leg"
                );
                self.close_leg(symbol, side, position, mark, true).await;
            }
            TrailOutcome::Hold { previous, current } => {
                leg.current_tier = current;
                if previous != current {
                    info!(
                        symbol,
                        %side,
                        from = %tier_label(previous),
                        to = %tier_label(current),
                        highest_pct = format!("{highest:.3}"),
                        "trailing tier updated"
                    );
                }
            }
        }
    }

    async fn close_leg(
        &mut self,
        symbol: &str,
        side: Side,
        position: &PositionSnapshot,
        mark: Decimal,
        is_profit: bool,
    ) -> bool {
        let request = CloseRequest {
            symbol: symbol.to_string(),
            side,
            amount: position.amount(),
            entry_price: position.entry_price,
            close_price: mark,
            is_profit,
        };
        self.closer.close(&mut self.registry, request).await.is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================

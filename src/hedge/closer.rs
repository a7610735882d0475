// =============================================================================
// Leg Closer — market-close one leg and account for the realized result
// =============================================================================
//
// Per successful close:
//   1. Market-close the leg through the exchange collaborator.
//   2. Compute realized profit from the price difference.
//   3. Fold it into the aggregate net loss.
//   4. Move the leg out of the registry into the pair record.
//   5. On the second leg of a pair: refresh cumulative profit from a live
//      balance read, evaluate the global stop, emit exactly one event and
//      drop the registry entry together with its pair record.
//
// An exchange failure leaves every piece of state untouched so the monitor
// can retry on its next cycle.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use super::aggregate::AggregateController;
use super::pnl;
use super::registry::{ClosedLeg, HedgePosition, HedgeRegistry};
use crate::exchange::FuturesExchange;
use crate::notify::{NotifyEvent, Notifier, PairReport, StopReport};
use crate::types::Side;

/// Invoked after every successful leg close.
pub type CloseCallback = Box<dyn Fn(&ClosedLeg) + Send + Sync>;

/// Everything needed to close one leg.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
    pub entry_price: Decimal,
    /// Mark price the close decision was taken at.
    pub close_price: Decimal,
    /// `true` for trailing-stop exits, `false` for stop-losses.
    pub is_profit: bool,
}

pub struct LegCloser {
    exchange: Arc<dyn FuturesExchange>,
    aggregate: Arc<AggregateController>,
    notifier: Arc<dyn Notifier>,
    on_position_closed: Option<CloseCallback>,
}

impl LegCloser {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        aggregate: Arc<AggregateController>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            exchange,
            aggregate,
            notifier,
            on_position_closed: None,
        }
    }

    pub fn set_callback(&mut self, callback: CloseCallback) {
        self.on_position_closed = Some(callback);
    }

    /// Close one leg. Returns the realized result on success.
    pub async fn close(
        &self,
        registry: &mut HedgeRegistry,
        req: CloseRequest,
    ) -> Option<ClosedLeg> {
        if !self.aggregate.is_running() {
            warn!(symbol = %req.symbol, side = %req.side, "close refused — trading halted");
            return None;
        }

        let ack = match self
            .exchange
            .close_position(&req.symbol, req.amount, req.side)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    symbol = %req.symbol,
                    side = %req.side,
                    amount = %req.amount,
                    error = %e,
                    "close order failed — leg stays registered for retry"
                );
                return None;
            }
        };

        let profit_usdt = pnl::profit_usdt(req.side, req.entry_price, req.close_price, req.amount);
        let result = ClosedLeg {
            symbol: req.symbol.clone(),
            side: req.side,
            amount: req.amount,
            entry_price: req.entry_price,
            close_price: req.close_price,
            profit_usdt,
            profit_pct: pnl::realized_pct(profit_usdt, req.entry_price, req.amount),
            is_profit: req.is_profit,
            close_time: Utc::now(),
        };

        let net_loss = self.aggregate.record_realized(profit_usdt);
        info!(
            symbol = %result.symbol,
            side = %result.side,
            order_id = ack.order_id,
            amount = %result.amount,
            entry_price = %result.entry_price,
            close_price = %result.close_price,
            profit_usdt = %result.profit_usdt,
            profit_pct = format!("{:.2}", result.profit_pct),
            kind = if result.is_profit { "trailing_stop" } else { "stop_loss" },
            net_loss_usdt = %net_loss,
            "leg closed"
        );

        self.settle(registry, result.clone()).await;

        if let Some(callback) = &self.on_position_closed {
            callback(&result);
        }
        Some(result)
    }

    /// Move the closed leg into the pair record and finish the pair if both
    /// sides are now done.
    async fn settle(&self, registry: &mut HedgeRegistry, result: ClosedLeg) {
        let symbol = result.symbol.clone();
        let Some(hedge) = registry.get_mut(&symbol) else {
            warn!(symbol = %symbol, side = %result.side, "closed leg had no registry entry");
            return;
        };

        hedge.take_leg(result.side);
        hedge.closed.record(result);

        if hedge.closed.completed().is_some() {
            if let Some(finished) = registry.remove(&symbol) {
                self.complete_pair(&symbol, finished).await;
            }
        } else if !hedge.has_open_legs() {
            info!(symbol = %symbol, "last open leg closed without a partner record — dropping entry");
            registry.remove(&symbol);
        }
    }

    async fn complete_pair(&self, symbol: &str, finished: HedgePosition) {
        let (Some(long), Some(short)) = (finished.closed.long, finished.closed.short) else {
            return;
        };

        let total_profit_usdt = long.profit_usdt + short.profit_usdt;
        let notional = long.entry_price * long.amount + short.entry_price * short.amount;
        let total_profit_pct = if notional.is_zero() {
            0.0
        } else {
            (total_profit_usdt / notional * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or_default()
        };

        match self.exchange.account_balance().await {
            Ok(balance) => {
                self.aggregate.refresh_cumulative(balance);
            }
            Err(e) => warn!(
                symbol,
                error = %e,
                "balance refresh failed — keeping previous cumulative profit"
            ),
        }
        self.aggregate.record_pair_completed();

        let report = PairReport {
            symbol: symbol.to_string(),
            long,
            short,
            total_profit_usdt,
            total_profit_pct,
            cumulative_profit_usdt: self.aggregate.cumulative_profit_usdt(),
            net_loss_usdt: self.aggregate.net_loss_usdt(),
        };

        info!(
            symbol,
            total_profit_usdt = %report.total_profit_usdt,
            total_profit_pct = format!("{:.2}", report.total_profit_pct),
            cumulative_profit_usdt = %report.cumulative_profit_usdt,
            net_loss_usdt = %report.net_loss_usdt,
            "hedge pair completed"
        );

        let event = match self.aggregate.evaluate_stop() {
            Some(reason) => NotifyEvent::GlobalStop(StopReport {
                reason,
                pair: report,
                initial_balance: self.aggregate.initial_balance(),
            }),
            None => NotifyEvent::PairCompleted(report),
        };
        self.notifier.notify(&event).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

// =============================================================================
// Pair Opener — opens the long and short legs of a new hedge
// =============================================================================
//
// Per instrument:
//   1. Skip if any position is already open on the symbol (or trading halted).
//   2. Cancel resting orders, read the book top (mark ± 0.05 % fallback).
//   3. Long limit one tick above the ask, short limit one tick below the bid,
//      both rounded down to the tick; quantity sized from the USDT amount and
//      leverage, rounded down to the step and bumped to the minimum notional.
//   4. Place both limits concurrently, poll fills for a bounded time, then
//      cancel any unfilled leg and re-send it as a market order.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tokio::time::{sleep, Instant};

use crate::config::PairConfig;
use crate::exchange::FuturesExchange;
use crate::types::{to_binance_symbol, InstrumentFilters, OpenOrder, OrderKind, Side};

/// Exchange minimum order value (USDT).
const MIN_NOTIONAL_USDT: Decimal = dec!(100);
/// Tick used when the instrument is missing from the filter cache.
const DEFAULT_TICK: Decimal = dec!(0.01);
/// Spread assumed around the mark price when the book is unavailable.
const FALLBACK_HALF_SPREAD: Decimal = dec!(0.0005);
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Sizing helpers
// ---------------------------------------------------------------------------

/// Round `value` down to a multiple of `increment`.
pub fn round_down(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).round_dp_with_strategy(0, RoundingStrategy::ToZero) * increment
}

fn round_up(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    (value / increment).round_dp_with_strategy(0, RoundingStrategy::AwayFromZero) * increment
}

/// Order quantity for `amount_usdt` of margin at `leverage`, or `None` when
/// the order cannot reach the minimum notional.
pub fn size_order(
    amount_usdt: Decimal,
    leverage: u32,
    price: Decimal,
    step: Option<Decimal>,
) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let step = step.unwrap_or(Decimal::ZERO);
    let mut qty = round_down(amount_usdt * Decimal::from(leverage) / price, step);

    if qty * price < MIN_NOTIONAL_USDT {
        qty = round_up(MIN_NOTIONAL_USDT / price, step);
    }
    (qty > Decimal::ZERO && qty * price >= MIN_NOTIONAL_USDT).then_some(qty)
}

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Orders sent for one new hedge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedPair {
    pub symbol: String,
    pub order_ids: Vec<u64>,
}

/// One leg's resting limit order.
#[derive(Debug, Clone, Copy)]
struct RestingLeg {
    side: Side,
    order_id: u64,
    amount_usdt: Decimal,
}

// ---------------------------------------------------------------------------
// Opener
// ---------------------------------------------------------------------------

pub struct PairOpener {
    exchange: Arc<dyn FuturesExchange>,
    running: Arc<AtomicBool>,
    leverage: u32,
    fill_timeout: Duration,
    fill_poll: Duration,
    filters: RwLock<HashMap<String, InstrumentFilters>>,
}

impl PairOpener {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        running: Arc<AtomicBool>,
        leverage: u32,
        fill_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            running,
            leverage,
            fill_timeout,
            fill_poll: FILL_POLL_INTERVAL,
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Override the fill polling cadence.
    pub fn with_fill_poll(mut self, poll: Duration) -> Self {
        self.fill_poll = poll;
        self
    }

    /// Load tick / step sizes for every instrument.
    pub async fn refresh_filters(&self) -> Result<usize> {
        let filters = self
            .exchange
            .instrument_filters()
            .await
            .context("failed to load instrument filters")?;
        let count = filters.len();
        *self.filters.write() = filters;
        Ok(count)
    }

    fn filters_for(&self, symbol: &str) -> Option<InstrumentFilters> {
        self.filters.read().get(symbol).copied()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open a new hedge on `instrument` unless one is already live.
    pub async fn process_pair(
        &self,
        instrument: &str,
        pair: &PairConfig,
    ) -> Result<Option<PlacedPair>> {
        let symbol = to_binance_symbol(instrument);
        if !self.is_running() {
            return Ok(None);
        }

        let positions = self
            .exchange
            .fetch_positions()
            .await
            .context("failed to fetch positions")?;
        if positions.iter().any(|p| p.symbol == symbol && p.side().is_some()) {
            debug!(symbol = %symbol, "position already open — skipping placement");
            return Ok(None);
        }

        self.exchange
            .cancel_all_orders(&symbol)
            .await
            .with_context(|| format!("failed to cancel open orders on {symbol}"))?;

        let (bid, ask) = match self.exchange.order_book_top(&symbol).await {
            Ok(top) => (top.bid, top.ask),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "order book unavailable — using mark price");
                let mark = self
                    .exchange
                    .mark_price(&symbol)
                    .await
                    .with_context(|| format!("failed to read mark price for {symbol}"))?;
                (
                    mark * (Decimal::ONE - FALLBACK_HALF_SPREAD),
                    mark * (Decimal::ONE + FALLBACK_HALF_SPREAD),
                )
            }
        };
        let mid = (bid + ask) / Decimal::TWO;

        let filters = self.filters_for(&symbol);
        let tick = filters.map_or(DEFAULT_TICK, |f| f.tick_size);
        let step = filters.map(|f| f.step_size);

        let long_price = round_down(ask + tick, tick);
        let short_price = round_down(bid - tick, tick);
        info!(
            symbol = %symbol,
            %bid,
            %ask,
            %long_price,
            %short_price,
            "placing hedge limit orders"
        );

        let (long, short) = tokio::join!(
            self.place_limit(&symbol, Side::Long, pair.long_amount_usdt, long_price, step),
            self.place_limit(&symbol, Side::Short, pair.short_amount_usdt, short_price, step),
        );
        let resting: Vec<RestingLeg> = [long, short].into_iter().flatten().collect();
        if resting.is_empty() {
            warn!(symbol = %symbol, "both limit orders failed");
            return Ok(None);
        }

        let filled = self.await_fills(&symbol, &resting).await;

        let mut order_ids = Vec::with_capacity(resting.len());
        for leg in &resting {
            if filled.contains(&leg.order_id) {
                order_ids.push(leg.order_id);
                continue;
            }
            if !self.is_running() {
                break;
            }
            warn!(symbol = %symbol, side = %leg.side, order_id = leg.order_id, "limit order unfilled — switching to market");
            if let Err(e) = self.exchange.cancel_order(&symbol, leg.order_id).await {
                warn!(symbol = %symbol, order_id = leg.order_id, error = %e, "cancel failed");
            }
            if let Some(order_id) = self.place_market(&symbol, leg.side, leg.amount_usdt, mid, step).await {
                order_ids.push(order_id);
            }
        }

        if order_ids.is_empty() {
            warn!(symbol = %symbol, "no hedge orders survived placement");
            return Ok(None);
        }
        info!(symbol = %symbol, order_ids = ?order_ids, "hedge orders placed");
        Ok(Some(PlacedPair { symbol, order_ids }))
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        amount_usdt: Decimal,
        price: Decimal,
        step: Option<Decimal>,
    ) -> Option<RestingLeg> {
        let Some(quantity) = size_order(amount_usdt, self.leverage, price, step) else {
            warn!(symbol, %side, %amount_usdt, %price, "order below minimum notional — skipping leg");
            return None;
        };
        let order = OpenOrder {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
        };
        let order_id = self.send(&order).await?;
        Some(RestingLeg {
            side,
            order_id,
            amount_usdt,
        })
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        amount_usdt: Decimal,
        reference_price: Decimal,
        step: Option<Decimal>,
    ) -> Option<u64> {
        let Some(quantity) = size_order(amount_usdt, self.leverage, reference_price, step) else {
            warn!(symbol, %side, "market fallback below minimum notional — skipping leg");
            return None;
        };
        let order = OpenOrder {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: None,
        };
        self.send(&order).await
    }

    /// Set leverage and submit one order; failures are logged per leg.
    async fn send(&self, order: &OpenOrder) -> Option<u64> {
        if let Err(e) = self.exchange.set_leverage(&order.symbol, self.leverage).await {
            error!(symbol = %order.symbol, side = %order.side, error = %e, "failed to set leverage");
            return None;
        }
        match self.exchange.open_order(order).await {
            Ok(ack) => {
                info!(
                    symbol = %order.symbol,
                    side = %order.side,
                    kind = %order.kind,
                    quantity = %order.quantity,
                    price = ?order.price,
                    order_id = ack.order_id,
                    "order accepted"
                );
                Some(ack.order_id)
            }
            Err(e) => {
                error!(symbol = %order.symbol, side = %order.side, kind = %order.kind, error = %e, "order rejected");
                None
            }
        }
    }

    /// Poll until every resting leg fills or the timeout elapses.
    async fn await_fills(&self, symbol: &str, resting: &[RestingLeg]) -> Vec<u64> {
        let deadline = Instant::now() + self.fill_timeout;
        let mut filled: Vec<u64> = Vec::new();

        loop {
            for leg in resting {
                if filled.contains(&leg.order_id) {
                    continue;
                }
                match self.exchange.order_filled(symbol, leg.order_id).await {
                    Ok(true) => {
                        info!(symbol, side = %leg.side, order_id = leg.order_id, "limit order filled");
                        filled.push(leg.order_id);
                    }
                    Ok(false) => {}
                    Err(e) => debug!(symbol, order_id = leg.order_id, error = %e, "fill check failed"),
                }
            }
            if filled.len() == resting.len() || Instant::now() >= deadline || !self.is_running() {
                return filled;
            }
            sleep(self.fill_poll).await;
        }
    }
}

impl std::fmt::Debug for PairOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairOpener")
            .field("leverage", &self.leverage)
            .field("fill_timeout", &self.fill_timeout)
            .field("filters", &self.filters.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

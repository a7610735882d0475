// =============================================================================
// In-memory exchange and notifier used by unit tests
// =============================================================================

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::exchange::{ExchangeError, ExchangeResult, FuturesExchange};
use crate::notify::{NotifyEvent, Notifier};
use crate::types::{
    BookTop, InstrumentFilters, OpenOrder, OrderAck, OrderKind, PositionSnapshot, Side,
};

#[derive(Default)]
struct State {
    /// (symbol, side) -> (unsigned amount, entry price)
    positions: HashMap<(String, Side), (Decimal, Decimal)>,
    prices: HashMap<String, Decimal>,
    books: HashMap<String, BookTop>,
    filters: HashMap<String, InstrumentFilters>,
    balance: Decimal,
    fail_balance: bool,
    fail_positions: bool,
    fail_price: HashSet<String>,
    fail_close: HashSet<(String, Side)>,
    limit_orders_fill: bool,
    next_order_id: u64,
    filled: HashSet<u64>,
    closes: Vec<(String, Decimal, Side)>,
    opens: Vec<(u64, OpenOrder)>,
    cancelled: Vec<(String, u64)>,
    cancel_all: Vec<String>,
    leverage: Vec<(String, u32)>,
    position_fetches: usize,
}

fn scripted(endpoint: &str) -> ExchangeError {
    ExchangeError::Api {
        endpoint: endpoint.to_string(),
        status: 500,
        code: -1000,
        msg: "scripted failure".into(),
    }
}

/// Scripted `FuturesExchange`. Successful closes remove the position, market
/// opens create one at the current mark price.
pub struct ScriptedExchange {
    state: Mutex<State>,
}

impl ScriptedExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(State {
                balance,
                next_order_id: 1,
                ..State::default()
            }),
        }
    }

    // ── Scripting ────────────────────────────────────────────────────────

    pub fn set_position(&self, symbol: &str, side: Side, amount: Decimal, entry: Decimal) {
        self.state
            .lock()
            .positions
            .insert((symbol.to_string(), side), (amount, entry));
    }

    pub fn clear_position(&self, symbol: &str, side: Side) {
        self.state.lock().positions.remove(&(symbol.to_string(), side));
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.state
            .lock()
            .books
            .insert(symbol.to_string(), BookTop { bid, ask });
    }

    pub fn set_filters(&self, symbol: &str, tick_size: Decimal, step_size: Decimal) {
        self.state.lock().filters.insert(
            symbol.to_string(),
            InstrumentFilters {
                tick_size,
                step_size,
            },
        );
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().balance = balance;
    }

    pub fn fail_balance(&self, fail: bool) {
        self.state.lock().fail_balance = fail;
    }

    pub fn fail_positions(&self, fail: bool) {
        self.state.lock().fail_positions = fail;
    }

    pub fn fail_price(&self, symbol: &str) {
        self.state.lock().fail_price.insert(symbol.to_string());
    }

    pub fn fail_close(&self, symbol: &str, side: Side) {
        self.state
            .lock()
            .fail_close
            .insert((symbol.to_string(), side));
    }

    pub fn allow_close(&self, symbol: &str, side: Side) {
        self.state
            .lock()
            .fail_close
            .remove(&(symbol.to_string(), side));
    }

    pub fn fill_limit_orders(&self, fill: bool) {
        self.state.lock().limit_orders_fill = fill;
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub fn closes(&self) -> Vec<(String, Decimal, Side)> {
        self.state.lock().closes.clone()
    }

    pub fn opens(&self) -> Vec<OpenOrder> {
        self.state.lock().opens.iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn cancelled(&self) -> Vec<(String, u64)> {
        self.state.lock().cancelled.clone()
    }

    pub fn cancel_all_calls(&self) -> Vec<String> {
        self.state.lock().cancel_all.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().leverage.clone()
    }

    pub fn position_fetches(&self) -> usize {
        self.state.lock().position_fetches
    }

    pub fn has_position(&self, symbol: &str, side: Side) -> bool {
        self.state
            .lock()
            .positions
            .contains_key(&(symbol.to_string(), side))
    }
}

#[async_trait]
impl FuturesExchange for ScriptedExchange {
    async fn fetch_positions(&self) -> ExchangeResult<Vec<PositionSnapshot>> {
        let mut s = self.state.lock();
        s.position_fetches += 1;
        if s.fail_positions {
            return Err(scripted("GET /fapi/v2/positionRisk"));
        }
        let mut out: Vec<PositionSnapshot> = s
            .positions
            .iter()
            .map(|((symbol, side), (amount, entry))| PositionSnapshot {
                symbol: symbol.clone(),
                position_amt: match side {
                    Side::Long => *amount,
                    Side::Short => -*amount,
                },
                entry_price: *entry,
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(b.position_amt.cmp(&a.position_amt)));
        Ok(out)
    }

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let s = self.state.lock();
        if s.fail_price.contains(symbol) {
            return Err(scripted("GET /fapi/v1/ticker/price"));
        }
        s.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| scripted("GET /fapi/v1/ticker/price"))
    }

    async fn account_balance(&self) -> ExchangeResult<Decimal> {
        let s = self.state.lock();
        if s.fail_balance {
            return Err(scripted("GET /fapi/v2/balance"));
        }
        Ok(s.balance)
    }

    async fn close_position(
        &self,
        symbol: &str,
        amount: Decimal,
        side: Side,
    ) -> ExchangeResult<OrderAck> {
        let mut s = self.state.lock();
        if s.fail_close.contains(&(symbol.to_string(), side)) {
            return Err(scripted("POST /fapi/v1/order"));
        }
        s.closes.push((symbol.to_string(), amount, side));
        s.positions.remove(&(symbol.to_string(), side));
        let order_id = s.next_order_id;
        s.next_order_id += 1;
        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: "FILLED".into(),
        })
    }

    async fn order_book_top(&self, symbol: &str) -> ExchangeResult<BookTop> {
        self.state
            .lock()
            .books
            .get(symbol)
            .copied()
            .ok_or_else(|| scripted("GET /fapi/v1/depth"))
    }

    async fn open_order(&self, order: &OpenOrder) -> ExchangeResult<OrderAck> {
        let mut s = self.state.lock();
        let order_id = s.next_order_id;
        s.next_order_id += 1;
        s.opens.push((order_id, order.clone()));

        let fills_now = order.kind == OrderKind::Market || s.limit_orders_fill;
        if fills_now {
            s.filled.insert(order_id);
            let price = order
                .price
                .or_else(|| s.prices.get(&order.symbol).copied())
                .unwrap_or(Decimal::ONE);
            s.positions
                .insert((order.symbol.clone(), order.side), (order.quantity, price));
        }

        Ok(OrderAck {
            order_id,
            symbol: order.symbol.clone(),
            status: if fills_now { "FILLED" } else { "NEW" }.into(),
        })
    }

    async fn order_filled(&self, _symbol: &str, order_id: u64) -> ExchangeResult<bool> {
        Ok(self.state.lock().filled.contains(&order_id))
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<()> {
        self.state
            .lock()
            .cancelled
            .push((symbol.to_string(), order_id));
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.state.lock().cancel_all.push(symbol.to_string());
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.state
            .lock()
            .leverage
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn instrument_filters(&self) -> ExchangeResult<HashMap<String, InstrumentFilters>> {
        Ok(self.state.lock().filters.clone())
    }
}

/// Captures every event instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotifyEvent) {
        self.events.lock().push(event.clone());
    }
}

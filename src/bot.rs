// =============================================================================
// Hedge Bot — order-placement loop and position-monitor loop
// =============================================================================
//
// Two long-running tasks share one running flag:
//
//   placement loop — every `monitor_interval_secs`, walks the configured
//                    instruments in batches of five, opening a hedge on each
//                    one that has no live position. Each task holds the
//                    placement lock for its whole placement. Order ids that
//                    have not been confirmed filled are parked in `pending`.
//
//   monitor loop   — every `monitor_poll_ms`, prunes filled ids from
//                    `pending` and runs one `HedgeMonitor` cycle.
//
// `pending` is only ever locked for a map read or update, so the monitor loop
// never waits on a placement's fill polling.
//
// Both loops exit once the flag is cleared (global stop or manual stop).
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{BotConfig, PairConfig};
use crate::exchange::FuturesExchange;
use crate::hedge::monitor::HedgeMonitor;
use crate::opener::{PairOpener, PlacedPair};

/// Instruments processed concurrently per placement batch.
const PLACEMENT_BATCH: usize = 5;
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// symbol -> order ids not yet confirmed filled.
pub type PendingOrders = Arc<Mutex<HashMap<String, Vec<u64>>>>;

pub struct HedgeBot {
    exchange: Arc<dyn FuturesExchange>,
    opener: Arc<PairOpener>,
    pairs: BTreeMap<String, PairConfig>,
    pending: PendingOrders,
    /// Held by each placement task for the whole of its placement.
    placement_lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    placement_interval: Duration,
    monitor_poll: Duration,
}

impl HedgeBot {
    pub fn new(
        exchange: Arc<dyn FuturesExchange>,
        opener: Arc<PairOpener>,
        running: Arc<AtomicBool>,
        config: &BotConfig,
    ) -> Self {
        Self {
            exchange,
            opener,
            pairs: config.trading_pairs.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            placement_lock: Arc::new(Mutex::new(())),
            running,
            placement_interval: Duration::from_secs(config.monitor_interval_secs),
            monitor_poll: Duration::from_millis(config.monitor_poll_ms),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pending_handle(&self) -> PendingOrders {
        Arc::clone(&self.pending)
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    /// Placement loop; returns once trading stops.
    pub async fn run_placement_loop(&self) {
        info!(
            instruments = self.pairs.len(),
            interval_secs = self.placement_interval.as_secs(),
            "order placement loop starting"
        );
        while self.is_running() {
            self.place_orders().await;
            self.pause(self.placement_interval).await;
        }
        info!("order placement loop stopped");
    }

    /// Sleep for `total`, waking early once trading stops.
    async fn pause(&self, total: Duration) {
        let deadline = tokio::time::Instant::now() + total;
        while self.is_running() {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(STOP_CHECK_INTERVAL)).await;
        }
    }

    /// One placement pass over every configured instrument.
    pub async fn place_orders(&self) {
        let instruments: Vec<(String, PairConfig)> = self
            .pairs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for batch in instruments.chunks(PLACEMENT_BATCH) {
            if !self.is_running() {
                break;
            }

            let mut tasks = JoinSet::new();
            for (instrument, pair) in batch.iter().cloned() {
                let opener = Arc::clone(&self.opener);
                let placement_lock = Arc::clone(&self.placement_lock);
                let pending = Arc::clone(&self.pending);
                tasks.spawn(async move {
                    // Placements are serialised: the position check and the
                    // orders it gates never interleave across instruments.
                    let _placing = placement_lock.lock().await;
                    match opener.process_pair(&instrument, &pair).await {
                        Ok(Some(PlacedPair { symbol, order_ids })) => {
                            pending.lock().await.entry(symbol).or_default().extend(order_ids);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(instrument = %instrument, error = %e, "hedge placement failed");
                        }
                    }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "placement task panicked");
                }
            }
        }
    }

    /// Drop filled order ids; symbols with nothing left pending are removed.
    ///
    /// The map is only locked to copy it and to apply the result, never
    /// while the exchange is queried.
    pub async fn check_pending_orders(&self) {
        let snapshot: Vec<(String, Vec<u64>)> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|(symbol, ids)| (symbol.clone(), ids.clone()))
            .collect();

        let mut filled: Vec<(String, u64)> = Vec::new();
        for (symbol, ids) in &snapshot {
            for &order_id in ids {
                match self.exchange.order_filled(symbol, order_id).await {
                    Ok(true) => {
                        debug!(symbol = %symbol, order_id, "pending order filled");
                        filled.push((symbol.clone(), order_id));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(symbol = %symbol, order_id, error = %e, "pending order status check failed");
                    }
                }
            }
        }

        let mut pending = self.pending.lock().await;
        for (symbol, order_id) in filled {
            if let Some(ids) = pending.get_mut(&symbol) {
                ids.retain(|&id| id != order_id);
            }
        }
        pending.retain(|_, ids| !ids.is_empty());
    }

    // -------------------------------------------------------------------------
    // Monitoring
    // -------------------------------------------------------------------------

    /// Monitor loop; owns the monitor and returns once trading stops.
    pub async fn run_monitor_loop(&self, mut monitor: HedgeMonitor) {
        info!(poll_ms = self.monitor_poll.as_millis() as u64, "position monitor loop starting");
        while self.is_running() {
            self.check_pending_orders().await;
            if let Err(e) = monitor.monitor_positions().await {
                error!(error = %e, "monitor cycle failed");
            }
            tokio::time::sleep(self.monitor_poll).await;
        }
        info!("position monitor loop stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hedge::aggregate::AggregateController;
    use crate::hedge::monitor::MonitorSettings;
    use crate::hedge::testing::{RecordingNotifier, ScriptedExchange};
    use crate::hedge::tiers::TierTable;
    use crate::types::{OpenOrder, OrderKind, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn config(instruments: &[&str]) -> BotConfig {
        let mut config = BotConfig::default();
        for inst in instruments {
            config.trading_pairs.insert(
                inst.to_string(),
                PairConfig {
                    long_amount_usdt: dec!(20),
                    short_amount_usdt: dec!(20),
                },
            );
        }
        config.monitor_poll_ms = 5;
        config
    }

    fn bot(exchange: &Arc<ScriptedExchange>, instruments: &[&str]) -> (HedgeBot, Arc<AtomicBool>) {
        bot_with_fill_timeout(exchange, instruments, Duration::from_millis(20))
    }

    fn bot_with_fill_timeout(
        exchange: &Arc<ScriptedExchange>,
        instruments: &[&str],
        fill_timeout: Duration,
    ) -> (HedgeBot, Arc<AtomicBool>) {
        let running = Arc::new(AtomicBool::new(true));
        let opener = Arc::new(
            PairOpener::new(exchange.clone(), running.clone(), 10, fill_timeout)
                .with_fill_poll(Duration::from_millis(5)),
        );
        let bot = HedgeBot::new(exchange.clone(), opener, running.clone(), &config(instruments));
        (bot, running)
    }

    fn resting_limit(symbol: &str) -> OpenOrder {
        OpenOrder {
            symbol: symbol.into(),
            side: Side::Long,
            kind: OrderKind::Limit,
            quantity: dec!(1),
            price: Some(dec!(100)),
        }
    }

    #[tokio::test]
    async fn placement_pass_opens_every_instrument() {
        let exchange = Arc::new(ScriptedExchange::new(dec!(1000)));
        let names = ["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT", "FUSDT", "GUSDT"];
        for name in names {
            exchange.set_book(name, dec!(99.9), dec!(100.1));
        }
        exchange.fill_limit_orders(true);
        let (bot, _) = bot(&exchange, &names);

        bot.place_orders().await;

        let pending = bot.pending_handle();
        let pending = pending.lock().await;
        assert_eq!(pending.len(), names.len());
        assert!(pending.values().all(|ids| ids.len() == 2));
        for name in names {
            assert!(exchange.has_position(name, Side::Long));
            assert!(exchange.has_position(name, Side::Short));
        }
    }

    #[tokio::test]
    async fn filled_orders_leave_the_pending_map() {
        let exchange = Arc::new(ScriptedExchange::new(dec!(1000)));
        exchange.set_price("XUSDT", dec!(100));
        let (bot, _) = bot(&exchange, &[]);

        let resting = exchange.open_order(&resting_limit("XUSDT")).await.unwrap();
        let mut market = resting_limit("YUSDT");
        market.kind = OrderKind::Market;
        let filled = exchange.open_order(&market).await.unwrap();

        {
            let mut pending = bot.pending.lock().await;
            pending.insert("XUSDT".into(), vec![resting.order_id]);
            pending.insert("YUSDT".into(), vec![filled.order_id]);
        }

        bot.check_pending_orders().await;

        let pending = bot.pending.lock().await;
        assert_eq!(pending.get("XUSDT"), Some(&vec![resting.order_id]));
        assert!(!pending.contains_key("YUSDT"));
    }

    #[tokio::test]
    async fn pending_check_does_not_wait_for_fill_polling() {
        let exchange = Arc::new(ScriptedExchange::new(dec!(1000)));
        let names = ["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT", "FUSDT"];
        for name in names {
            exchange.set_book(name, dec!(99.9), dec!(100.1));
            exchange.set_price(name, dec!(100));
        }
        let (bot, _) = bot_with_fill_timeout(&exchange, &names, Duration::from_millis(300));
        let bot = Arc::new(bot);

        let placing = bot.clone();
        let placement = tokio::spawn(async move { placing.place_orders().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!placement.is_finished(), "first placement is still polling fills");

        let started = tokio::time::Instant::now();
        bot.check_pending_orders().await;
        let _ = bot.pending_handle().lock().await.len();
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "pending check waited {:?}",
            started.elapsed()
        );

        placement.abort();
    }

    #[tokio::test]
    async fn instruments_sharing_a_symbol_open_one_hedge() {
        let exchange = Arc::new(ScriptedExchange::new(dec!(1000)));
        exchange.set_book("XUSDT", dec!(99.9), dec!(100.1));
        exchange.fill_limit_orders(true);
        let (bot, _) = bot(&exchange, &["X-USDT-SWAP", "XUSDT"]);

        bot.place_orders().await;

        assert_eq!(exchange.opens().len(), 2, "one long and one short only");
        let pending = bot.pending.lock().await;
        assert_eq!(pending.get("XUSDT").map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn halted_bot_places_nothing() {
        let exchange = Arc::new(ScriptedExchange::new(dec!(1000)));
        exchange.set_book("XUSDT", dec!(99.9), dec!(100.1));
        let (bot, running) = bot(&exchange, &["XUSDT"]);
        running.store(false, Ordering::SeqCst);

        bot.place_orders().await;
        assert!(exchange.opens().is_empty());
        assert!(bot.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn monitor_loop_exits_when_flag_clears() {
        let exchange = Arc::new(ScriptedExchange::new(dec!(1000)));
        let aggregate = Arc::new(AggregateController::new(dec!(1000), None, None));
        let running = aggregate.running_flag();
        let opener = Arc::new(PairOpener::new(
            exchange.clone(),
            running.clone(),
            10,
            Duration::from_millis(20),
        ));
        let bot = HedgeBot::new(exchange.clone(), opener, running, &config(&[]));
        let monitor = HedgeMonitor::new(
            exchange.clone(),
            aggregate.clone(),
            Arc::new(RecordingNotifier::default()),
            TierTable::default(),
            MonitorSettings::default(),
        );

        let stopper = aggregate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.stop();
        });

        tokio::time::timeout(Duration::from_secs(2), bot.run_monitor_loop(monitor))
            .await
            .expect("monitor loop should stop with the running flag");
        assert!(exchange.position_fetches() > 0);
        assert_eq!(Decimal::ZERO, aggregate.net_loss_usdt());
    }
}

// =============================================================================
// Hedge Trail Bot — Main Entry Point
// =============================================================================
//
// Opens paired long/short positions on every configured instrument, then
// manages each pair with a stop-loss and an 11-tier trailing take-profit.
// A global stop (cumulative loss floor or profit target) halts everything
// for the rest of the process lifetime.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod bot;
mod config;
mod exchange;
mod hedge;
mod notify;
mod opener;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::binance::client::BinanceFuturesClient;
use crate::bot::HedgeBot;
use crate::config::BotConfig;
use crate::exchange::FuturesExchange;
use crate::hedge::aggregate::AggregateController;
use crate::hedge::monitor::{HedgeMonitor, MonitorSettings};
use crate::notify::Notifier;
use crate::opener::PairOpener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Hedge Trail Bot — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HEDGE_CONFIG").ok())
        .unwrap_or_else(|| "config.json".into());

    let mut config = BotConfig::load(&config_path)?;
    config.apply_env_overrides();
    config.validate().context("invalid configuration")?;

    info!(
        instruments = ?config.trading_pairs.keys().collect::<Vec<_>>(),
        leverage = config.leverage,
        testnet = config.binance.testnet,
        "Configured trading pairs"
    );

    // ── 2. Binance client ────────────────────────────────────────────────
    let exchange: Arc<dyn FuturesExchange> = Arc::new(BinanceFuturesClient::new(
        &config.binance.api_key,
        config.binance.secret.clone(),
        config.binance.testnet,
    )?);

    // ── 3. Aggregate controller (initial balance is mandatory) ───────────
    let initial_balance = exchange
        .account_balance()
        .await
        .context("failed to read initial account balance")?;
    info!(%initial_balance, "initial USDT balance captured");

    let aggregate = Arc::new(AggregateController::new(
        initial_balance,
        config.max_total_loss_usdt,
        config.min_total_profit_usdt,
    ));
    let running = aggregate.running_flag();

    // ── 4. Notifier & monitor ────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = Arc::from(notify::from_config(
        config.enable_dingtalk_notification,
        &config.dingtalk_webhook,
    )?);

    let mut monitor = HedgeMonitor::new(
        exchange.clone(),
        aggregate.clone(),
        notifier,
        config.tier_table(),
        MonitorSettings::from_config(&config),
    );
    monitor.on_position_closed(Box::new(|leg| {
        debug!(
            symbol = %leg.symbol,
            side = %leg.side,
            profit_usdt = %leg.profit_usdt,
            is_profit = leg.is_profit,
            "leg closed"
        );
    }));
    let hedges = monitor.snapshot_handle();

    // ── 5. Pair opener ───────────────────────────────────────────────────
    let opener = Arc::new(PairOpener::new(
        exchange.clone(),
        running.clone(),
        config.leverage,
        Duration::from_secs_f64(config.order_fill_timeout_secs),
    ));
    match opener.refresh_filters().await {
        Ok(count) => info!(count, "instrument filters loaded"),
        Err(e) => warn!(error = %e, "instrument filters unavailable — using default tick size"),
    }

    let bot = Arc::new(HedgeBot::new(exchange.clone(), opener, running.clone(), &config));

    // ── 6. Start the API server ──────────────────────────────────────────
    let admin_token = std::env::var(api::auth::ADMIN_TOKEN_ENV).unwrap_or_default();
    if admin_token.is_empty() {
        warn!("{} not set — control API will reject authenticated calls", api::auth::ADMIN_TOKEN_ENV);
    }
    let api_state = Arc::new(ApiState::new(
        aggregate.clone(),
        hedges,
        bot.pending_handle(),
        admin_token,
    ));
    let bind_addr = config.api.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    tokio::spawn(async move {
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 7. Order-placement loop ──────────────────────────────────────────
    let placement_bot = bot.clone();
    let placement = tokio::spawn(async move {
        placement_bot.run_placement_loop().await;
    });

    // ── 8. Position-monitor loop ─────────────────────────────────────────
    let monitor_bot = bot.clone();
    let monitoring = tokio::spawn(async move {
        monitor_bot.run_monitor_loop(monitor).await;
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Shutdown ──────────────────────────────────────────────────────
    let halted = {
        let aggregate = aggregate.clone();
        async move {
            while aggregate.is_running() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            warn!("Shutdown signal received — stopping gracefully");
        }
        _ = halted => {
            warn!(reason = ?aggregate.stop_reason(), "Trading halted — shutting down");
        }
    }
    aggregate.stop();

    for (name, handle) in [("placement", placement), ("monitor", monitoring)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "task ended abnormally");
        }
    }

    let snapshot = aggregate.snapshot();
    info!(
        net_loss_usdt = %snapshot.net_loss_usdt,
        cumulative_profit_usdt = %snapshot.cumulative_profit_usdt,
        pairs_completed = snapshot.pairs_completed,
        "Hedge Trail Bot shut down complete."
    );
    Ok(())
}

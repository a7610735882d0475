// =============================================================================
// Notifier — pair-completion and global-stop events
// =============================================================================
//
// The hedge core only produces `NotifyEvent` values. Rendering (markdown) and
// delivery live here. Delivery failures are logged and swallowed: a lost
// notification must never interfere with position management.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::hedge::aggregate::StopReason;
use crate::hedge::registry::ClosedLeg;

const DINGTALK_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Events
// =============================================================================

/// Both legs of a hedge have closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairReport {
    pub symbol: String,
    pub long: ClosedLeg,
    pub short: ClosedLeg,
    /// Sum of both legs' price-difference PnL.
    pub total_profit_usdt: Decimal,
    /// `total_profit_usdt` relative to both legs' entry notional.
    pub total_profit_pct: f64,
    pub cumulative_profit_usdt: Decimal,
    pub net_loss_usdt: Decimal,
}

/// A global stop condition fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub reason: StopReason,
    /// The pair whose completion triggered the stop.
    pub pair: PairReport,
    pub initial_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    PairCompleted(PairReport),
    GlobalStop(StopReport),
}

impl NotifyEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::PairCompleted(r) => &r.symbol,
            Self::GlobalStop(r) => &r.pair.symbol,
        }
    }
}

/// Delivery channel for human-readable events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotifyEvent);
}

// =============================================================================
// Markdown rendering
// =============================================================================

fn trend(value: Decimal) -> &'static str {
    if value >= Decimal::ZERO {
        "📈"
    } else {
        "📉"
    }
}

fn render_leg(title: &str, leg: &ClosedLeg) -> String {
    format!(
        "## {title}\n\
         - **Entry price**: {entry}\n\
         - **Close price**: {close}\n\
         - **Amount**: {amount}\n\
         - **Profit**: {trend} {profit:.2} USDT ({pct:.2}%)\n\
         - **Closed at**: {time}\n",
        entry = leg.entry_price,
        close = leg.close_price,
        amount = leg.amount,
        trend = trend(leg.profit_usdt),
        profit = leg.profit_usdt,
        pct = leg.profit_pct,
        time = leg.close_time.format("%Y-%m-%d %H:%M:%S"),
    )
}

fn render_pair(report: &PairReport) -> String {
    format!(
        "**Symbol**: {symbol}\n\n---\n\n{long}\n---\n\n{short}\n---\n\n\
         ## Hedge result\n\
         **Pair profit**: {trend} {total:.2} USDT ({pct:.2}%)\n\n\
         **Cumulative profit**: {cum_trend} {cumulative:.2} USDT\n\n\
         **Net loss**: {net_loss:.2} USDT\n",
        symbol = report.symbol,
        long = render_leg("Long leg", &report.long),
        short = render_leg("Short leg", &report.short),
        trend = trend(report.total_profit_usdt),
        total = report.total_profit_usdt,
        pct = report.total_profit_pct,
        cum_trend = trend(report.cumulative_profit_usdt),
        cumulative = report.cumulative_profit_usdt,
        net_loss = report.net_loss_usdt,
    )
}

/// `(title, markdown body)` for an event.
pub fn render_markdown(event: &NotifyEvent) -> (String, String) {
    match event {
        NotifyEvent::PairCompleted(report) => (
            format!("Hedge pair completed - {}", report.symbol),
            format!(
                "# ✅ Hedge pair completed\n\n{}\n---\n*hedge-trail-bot*",
                render_pair(report)
            ),
        ),
        NotifyEvent::GlobalStop(report) => (
            format!("Trading halted - {}", report.pair.symbol),
            format!(
                "# 🛑 Trading halted\n\n**Reason**: {reason}\n\n**Initial balance**: {initial:.2} USDT\n\n---\n\n{pair}\n---\n*hedge-trail-bot*",
                reason = report.reason,
                initial = report.initial_balance,
                pair = render_pair(&report.pair),
            ),
        ),
    }
}

// =============================================================================
// DingTalk
// =============================================================================

/// Posts markdown messages to a DingTalk robot webhook.
pub struct DingTalkNotifier {
    webhook: String,
    client: reqwest::Client,
}

impl DingTalkNotifier {
    pub fn new(webhook: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DINGTALK_TIMEOUT)
            .build()?;
        Ok(Self {
            webhook: webhook.into(),
            client,
        })
    }

    async fn send(&self, title: &str, text: &str) -> anyhow::Result<()> {
        let payload = json!({
            "msgtype": "markdown",
            "markdown": { "title": title, "text": text },
        });

        let resp = self
            .client
            .post(&self.webhook)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;

        let errcode = body["errcode"].as_i64().unwrap_or(-1);
        if !status.is_success() || errcode != 0 {
            anyhow::bail!(
                "DingTalk returned {} (errcode {}): {}",
                status,
                errcode,
                body["errmsg"].as_str().unwrap_or_default()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for DingTalkNotifier {
    async fn notify(&self, event: &NotifyEvent) {
        let (title, text) = render_markdown(event);
        match self.send(&title, &text).await {
            Ok(()) => info!(symbol = event.symbol(), title = %title, "DingTalk notification sent"),
            Err(e) => warn!(symbol = event.symbol(), error = %e, "DingTalk notification failed"),
        }
    }
}

impl std::fmt::Debug for DingTalkNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkNotifier")
            .field("webhook", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Log-only fallback
// =============================================================================

/// Used when notifications are disabled or no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotifyEvent) {
        match event {
            NotifyEvent::PairCompleted(r) => info!(
                symbol = %r.symbol,
                total_profit_usdt = %r.total_profit_usdt,
                total_profit_pct = r.total_profit_pct,
                cumulative_profit_usdt = %r.cumulative_profit_usdt,
                net_loss_usdt = %r.net_loss_usdt,
                "hedge pair completed"
            ),
            NotifyEvent::GlobalStop(r) => warn!(
                symbol = %r.pair.symbol,
                reason = %r.reason,
                cumulative_profit_usdt = %r.pair.cumulative_profit_usdt,
                "trading halted"
            ),
        }
        debug!("notification delivered to log");
    }
}

/// Pick the delivery channel from configuration.
pub fn from_config(enabled: bool, webhook: &str) -> anyhow::Result<Box<dyn Notifier>> {
    if !enabled {
        info!("DingTalk notifications disabled — logging events only");
        return Ok(Box::new(LogNotifier));
    }
    if webhook.trim().is_empty() {
        warn!("DingTalk webhook not configured — logging events only");
        return Ok(Box::new(LogNotifier));
    }
    Ok(Box::new(DingTalkNotifier::new(webhook.trim())?))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn leg(side: Side, profit: Decimal) -> ClosedLeg {
        ClosedLeg {
            symbol: "XUSDT".into(),
            side,
            amount: dec!(1),
            entry_price: dec!(100),
            close_price: dec!(98),
            profit_usdt: profit,
            profit_pct: 0.0,
            is_profit: profit > Decimal::ZERO,
            close_time: Utc::now(),
        }
    }

    fn report() -> PairReport {
        PairReport {
            symbol: "XUSDT".into(),
            long: leg(Side::Long, dec!(-2)),
            short: leg(Side::Short, dec!(3.4)),
            total_profit_usdt: dec!(1.4),
            total_profit_pct: 0.7,
            cumulative_profit_usdt: dec!(1.1),
            net_loss_usdt: dec!(0),
        }
    }

    #[test]
    fn pair_markdown_mentions_both_legs_and_totals() {
        let (title, text) = render_markdown(&NotifyEvent::PairCompleted(report()));
        assert_eq!(title, "Hedge pair completed - XUSDT");
        assert!(text.contains("Long leg"));
        assert!(text.contains("Short leg"));
        assert!(text.contains("1.40 USDT (0.70%)"));
        assert!(text.contains("**Net loss**: 0.00 USDT"));
    }

    #[test]
    fn stop_markdown_carries_reason() {
        let event = NotifyEvent::GlobalStop(StopReport {
            reason: StopReason::MaxTotalLoss {
                cumulative_profit_usdt: dec!(-55),
                threshold_usdt: dec!(-50),
            },
            pair: report(),
            initial_balance: dec!(1000),
        });
        let (title, text) = render_markdown(&event);
        assert!(title.starts_with("Trading halted"));
        assert!(text.contains("loss limit -50 USDT"));
        assert_eq!(event.symbol(), "XUSDT");
    }

    #[test]
    fn disabled_or_missing_webhook_falls_back_to_log() {
        assert!(from_config(false, "https://oapi.dingtalk.com/robot/send?access_token=x").is_ok());
        assert!(from_config(true, "   ").is_ok());
    }

    #[tokio::test]
    async fn log_notifier_accepts_all_events() {
        LogNotifier.notify(&NotifyEvent::PairCompleted(report())).await;
    }
}

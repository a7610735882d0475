// =============================================================================
// Aggregate Controller — process-wide realized PnL and the global stop
// =============================================================================
//
// Counters:
//   - net loss          — realized losses minus offsetting realized gains,
//                         floored at zero.
//   - cumulative profit — account balance minus the balance captured at
//                         startup, refreshed at pair completion.
//
// Global stop conditions (both optional, evaluated at pair completion):
//   1. cumulative <= max_total_loss_usdt   (negative threshold)
//   2. cumulative >= min_total_profit_usdt (positive target)
//
// Either one clears the shared `running` flag. Clearing is terminal: no code
// path ever sets it back to true.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why the process stopped trading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    MaxTotalLoss {
        cumulative_profit_usdt: Decimal,
        threshold_usdt: Decimal,
    },
    MinTotalProfit {
        cumulative_profit_usdt: Decimal,
        target_usdt: Decimal,
    },
    Manual,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxTotalLoss {
                cumulative_profit_usdt,
                threshold_usdt,
            } => write!(
                f,
                "cumulative profit {cumulative_profit_usdt} USDT reached loss limit {threshold_usdt} USDT"
            ),
            Self::MinTotalProfit {
                cumulative_profit_usdt,
                target_usdt,
            } => write!(
                f,
                "cumulative profit {cumulative_profit_usdt} USDT reached profit target {target_usdt} USDT"
            ),
            Self::Manual => write!(f, "stopped by operator"),
        }
    }
}

/// Point-in-time view for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub running: bool,
    pub initial_balance: Decimal,
    pub last_balance: Decimal,
    pub net_loss_usdt: Decimal,
    pub cumulative_profit_usdt: Decimal,
    pub max_total_loss_usdt: Option<Decimal>,
    pub min_total_profit_usdt: Option<Decimal>,
    pub pairs_completed: u64,
    pub stop_reason: Option<StopReason>,
    pub stopped_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    net_loss_usdt: Decimal,
    cumulative_profit_usdt: Decimal,
    last_balance: Decimal,
    pairs_completed: u64,
    stop_reason: Option<StopReason>,
    stopped_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Aggregate Controller
// ---------------------------------------------------------------------------

pub struct AggregateController {
    running: Arc<AtomicBool>,
    initial_balance: Decimal,
    max_total_loss_usdt: Option<Decimal>,
    min_total_profit_usdt: Option<Decimal>,
    state: RwLock<Inner>,
}

impl AggregateController {
    /// Create the controller with the balance captured at startup.
    pub fn new(
        initial_balance: Decimal,
        max_total_loss_usdt: Option<Decimal>,
        min_total_profit_usdt: Option<Decimal>,
    ) -> Self {
        info!(
            %initial_balance,
            max_total_loss_usdt = ?max_total_loss_usdt,
            min_total_profit_usdt = ?min_total_profit_usdt,
            "AggregateController initialised"
        );

        Self {
            running: Arc::new(AtomicBool::new(true)),
            initial_balance,
            max_total_loss_usdt,
            min_total_profit_usdt,
            state: RwLock::new(Inner {
                net_loss_usdt: Decimal::ZERO,
                cumulative_profit_usdt: Decimal::ZERO,
                last_balance: initial_balance,
                pairs_completed: 0,
                stop_reason: None,
                stopped_at: None,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Running flag
    // -------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared handle for loops that only need to observe the flag.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Operator / shutdown stop. No-op when already stopped.
    pub fn stop(&self) {
        if self.halt(StopReason::Manual) {
            warn!("trading stopped by operator");
        }
    }

    /// Clear the running flag; returns `true` only for the call that did it.
    fn halt(&self, reason: StopReason) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let mut s = self.state.write();
        s.stop_reason = Some(reason);
        s.stopped_at = Some(Utc::now());
        true
    }

    // -------------------------------------------------------------------------
    // Realized PnL
    // -------------------------------------------------------------------------

    /// Fold one realized leg result into net loss and return the new value.
    pub fn record_realized(&self, profit_usdt: Decimal) -> Decimal {
        let mut s = self.state.write();
        s.net_loss_usdt = if profit_usdt < Decimal::ZERO {
            s.net_loss_usdt + profit_usdt.abs()
        } else {
            (s.net_loss_usdt - profit_usdt).max(Decimal::ZERO)
        };
        debug!(%profit_usdt, net_loss_usdt = %s.net_loss_usdt, "realized result recorded");
        s.net_loss_usdt
    }

    /// Recompute cumulative profit from a fresh balance reading.
    pub fn refresh_cumulative(&self, balance: Decimal) -> Decimal {
        let mut s = self.state.write();
        s.last_balance = balance;
        s.cumulative_profit_usdt = balance - self.initial_balance;
        s.cumulative_profit_usdt
    }

    pub fn record_pair_completed(&self) {
        self.state.write().pairs_completed += 1;
    }

    // -------------------------------------------------------------------------
    // Global stop
    // -------------------------------------------------------------------------

    /// Evaluate both stop conditions against the current cumulative profit.
    ///
    /// Returns the reason only when this call transitioned the process into
    /// the stopped state.
    pub fn evaluate_stop(&self) -> Option<StopReason> {
        let cumulative = self.state.read().cumulative_profit_usdt;

        let reason = match (self.max_total_loss_usdt, self.min_total_profit_usdt) {
            (Some(threshold), _) if cumulative <= threshold => StopReason::MaxTotalLoss {
                cumulative_profit_usdt: cumulative,
                threshold_usdt: threshold,
            },
            (_, Some(target)) if cumulative >= target => StopReason::MinTotalProfit {
                cumulative_profit_usdt: cumulative,
                target_usdt: target,
            },
            _ => return None,
        };

        if self.halt(reason.clone()) {
            warn!(reason = %reason, "global stop condition reached — trading halted");
            Some(reason)
        } else {
            None
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    pub fn net_loss_usdt(&self) -> Decimal {
        self.state.read().net_loss_usdt
    }

    pub fn cumulative_profit_usdt(&self) -> Decimal {
        self.state.read().cumulative_profit_usdt
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.read().stop_reason.clone()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let s = self.state.read();
        AggregateSnapshot {
            running: self.is_running(),
            initial_balance: self.initial_balance,
            last_balance: s.last_balance,
            net_loss_usdt: s.net_loss_usdt,
            cumulative_profit_usdt: s.cumulative_profit_usdt,
            max_total_loss_usdt: self.max_total_loss_usdt,
            min_total_profit_usdt: self.min_total_profit_usdt,
            pairs_completed: s.pairs_completed,
            stop_reason: s.stop_reason.clone(),
            stopped_at: s.stopped_at,
        }
    }
}

impl std::fmt::Debug for AggregateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("AggregateController")
            .field("running", &self.is_running())
            .field("initial_balance", &self.initial_balance)
            .field("net_loss_usdt", &s.net_loss_usdt)
            .field("cumulative_profit_usdt", &s.cumulative_profit_usdt)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

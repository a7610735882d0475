// =============================================================================
// Hedge Registry — one cohesive state record per symbol
// =============================================================================
//
// A `HedgePosition` exists while at least one of its legs is open. It carries
// both legs' tracking state (entry, open time, high-water mark, tier) and the
// realized results of legs that already closed, so that the pair record is
// dropped in the same step as the registry entry itself.
//
// The registry is owned by the monitor task and mutated only there.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::tiers::{tier_label, TierLevel};
use crate::types::Side;

// =============================================================================
// Leg
// =============================================================================

/// Tracking state for one open side of a hedge.
#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub entry_price: Decimal,
    /// Unsigned position size.
    pub amount: Decimal,
    pub opened_at: Instant,
    /// Peak profit (%) since open. Starts at 0 and never decreases.
    pub highest_profit_pct: f64,
    pub current_tier: Option<TierLevel>,
    last_logged: Option<Instant>,
}

impl Leg {
    pub fn new(entry_price: Decimal, amount: Decimal, opened_at: Instant) -> Self {
        Self {
            entry_price,
            amount,
            opened_at,
            highest_profit_pct: 0.0,
            current_tier: None,
            last_logged: None,
        }
    }

    /// Fold a fresh profit reading into the high-water mark and return it.
    pub fn observe(&mut self, profit_pct: f64) -> f64 {
        if profit_pct > self.highest_profit_pct {
            self.highest_profit_pct = profit_pct;
        }
        self.highest_profit_pct
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened_at)
    }

    /// Throttle gate for periodic status lines.
    pub fn should_log(&mut self, now: Instant, interval: Duration) -> bool {
        let due = self
            .last_logged
            .map_or(true, |at| now.saturating_duration_since(at) >= interval);
        if due {
            self.last_logged = Some(now);
        }
        due
    }
}

// =============================================================================
// Realized results
// =============================================================================

/// Realized result of closing one leg.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedLeg {
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub close_price: Decimal,
    pub profit_usdt: Decimal,
    pub profit_pct: f64,
    /// `true` for trailing-stop exits, `false` for stop-loss exits.
    pub is_profit: bool,
    pub close_time: DateTime<Utc>,
}

/// Per-symbol accumulator of realized leg results, at most one per side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairProfitRecord {
    pub long: Option<ClosedLeg>,
    pub short: Option<ClosedLeg>,
}

impl PairProfitRecord {
    pub fn record(&mut self, result: ClosedLeg) {
        match result.side {
            Side::Long => self.long = Some(result),
            Side::Short => self.short = Some(result),
        }
    }

    /// Both sides once both have closed.
    pub fn completed(&self) -> Option<(&ClosedLeg, &ClosedLeg)> {
        match (&self.long, &self.short) {
            (Some(long), Some(short)) => Some((long, short)),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.long.is_none() && self.short.is_none()
    }
}

// =============================================================================
// HedgePosition
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HedgePosition {
    pub long: Option<Leg>,
    pub short: Option<Leg>,
    pub closed: PairProfitRecord,
}

impl HedgePosition {
    /// Both legs freshly observed at `now`.
    pub fn opened(long: Leg, short: Leg) -> Self {
        Self {
            long: Some(long),
            short: Some(short),
            closed: PairProfitRecord::default(),
        }
    }

    pub fn leg(&self, side: Side) -> Option<&Leg> {
        match side {
            Side::Long => self.long.as_ref(),
            Side::Short => self.short.as_ref(),
        }
    }

    pub fn leg_mut(&mut self, side: Side) -> Option<&mut Leg> {
        match side {
            Side::Long => self.long.as_mut(),
            Side::Short => self.short.as_mut(),
        }
    }

    pub fn set_leg(&mut self, side: Side, leg: Leg) {
        match side {
            Side::Long => self.long = Some(leg),
            Side::Short => self.short = Some(leg),
        }
    }

    pub fn take_leg(&mut self, side: Side) -> Option<Leg> {
        match side {
            Side::Long => self.long.take(),
            Side::Short => self.short.take(),
        }
    }

    pub fn has_open_legs(&self) -> bool {
        self.long.is_some() || self.short.is_some()
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
pub struct HedgeRegistry {
    entries: HashMap<String, HedgePosition>,
}

impl HedgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&HedgePosition> {
        self.entries.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut HedgePosition> {
        self.entries.get_mut(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn has_leg(&self, symbol: &str, side: Side) -> bool {
        self.entries
            .get(symbol)
            .is_some_and(|h| h.leg(side).is_some())
    }

    pub fn upsert(&mut self, symbol: impl Into<String>, position: HedgePosition) {
        self.entries.insert(symbol.into(), position);
    }

    pub fn remove(&mut self, symbol: &str) -> Option<HedgePosition> {
        self.entries.remove(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only view for the control API, sorted by symbol.
    pub fn snapshot(&self, now: Instant) -> Vec<HedgeView> {
        let mut views: Vec<HedgeView> = self
            .entries
            .iter()
            .map(|(symbol, hedge)| HedgeView {
                symbol: symbol.clone(),
                legs: Side::BOTH
                    .iter()
                    .filter_map(|&side| {
                        hedge.leg(side).map(|leg| LegView {
                            side,
                            entry_price: leg.entry_price,
                            amount: leg.amount,
                            age_secs: leg.age(now).as_secs_f64(),
                            highest_profit_pct: leg.highest_profit_pct,
                            tier: tier_label(leg.current_tier),
                        })
                    })
                    .collect(),
                closed_sides: Side::BOTH
                    .iter()
                    .copied()
                    .filter(|&side| match side {
                        Side::Long => hedge.closed.long.is_some(),
                        Side::Short => hedge.closed.short.is_some(),
                    })
                    .collect(),
            })
            .collect();
        views.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        views
    }
}

/// Serialisable view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct HedgeView {
    pub symbol: String,
    pub legs: Vec<LegView>,
    pub closed_sides: Vec<Side>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegView {
    pub side: Side,
    pub entry_price: Decimal,
    pub amount: Decimal,
    pub age_secs: f64,
    pub highest_profit_pct: f64,
    pub tier: String,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn closed(side: Side) -> ClosedLeg {
        ClosedLeg {
            symbol: "XUSDT".into(),
            side,
            amount: dec!(1),
            entry_price: dec!(100),
            close_price: dec!(98),
            profit_usdt: dec!(-2),
            profit_pct: -2.0,
            is_profit: false,
            close_time: Utc::now(),
        }
    }

    #[test]
    fn high_water_mark_never_decreases() {
        let mut leg = Leg::new(dec!(100), dec!(1), Instant::now());
        assert_eq!(leg.observe(-0.5), 0.0);
        assert_eq!(leg.observe(1.2), 1.2);
        assert_eq!(leg.observe(0.4), 1.2);
        assert_eq!(leg.observe(1.5), 1.5);
    }

    #[test]
    fn status_log_is_throttled() {
        let t0 = Instant::now();
        let mut leg = Leg::new(dec!(100), dec!(1), t0);
        let interval = Duration::from_secs(5);
        assert!(leg.should_log(t0, interval));
        assert!(!leg.should_log(t0 + Duration::from_secs(4), interval));
        assert!(leg.should_log(t0 + Duration::from_secs(5), interval));
    }

    #[test]
    fn pair_record_completes_with_both_sides() {
        let mut record = PairProfitRecord::default();
        assert!(record.is_empty());
        record.record(closed(Side::Short));
        assert!(record.completed().is_none());
        record.record(closed(Side::Long));
        let (long, short) = record.completed().unwrap();
        assert_eq!(long.side, Side::Long);
        assert_eq!(short.side, Side::Short);
    }

    #[test]
    fn registry_get_upsert_remove() {
        let now = Instant::now();
        let mut registry = HedgeRegistry::new();
        registry.upsert(
            "XUSDT",
            HedgePosition::opened(
                Leg::new(dec!(100), dec!(1), now),
                Leg::new(dec!(100), dec!(1), now),
            ),
        );
        assert!(registry.has_leg("XUSDT", Side::Long));

        let hedge = registry.get_mut("XUSDT").unwrap();
        hedge.take_leg(Side::Long);
        assert!(hedge.has_open_legs());
        assert!(!registry.has_leg("XUSDT", Side::Long));
        assert!(registry.has_leg("XUSDT", Side::Short));

        assert!(registry.remove("XUSDT").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_lists_open_legs_and_closed_sides() {
        let now = Instant::now();
        let mut registry = HedgeRegistry::new();
        let mut hedge = HedgePosition::opened(
            Leg::new(dec!(100), dec!(1), now),
            Leg::new(dec!(101), dec!(1), now),
        );
        hedge.take_leg(Side::Long);
        hedge.closed.record(closed(Side::Long));
        registry.upsert("XUSDT", hedge);

        let views = registry.snapshot(now + Duration::from_secs(3));
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].legs.len(), 1);
        assert_eq!(views[0].legs[0].side, Side::Short);
        assert_eq!(views[0].legs[0].tier, "none");
        assert_eq!(views[0].closed_sides, vec![Side::Long]);
        assert!((views[0].legs[0].age_secs - 3.0).abs() < 1e-9);
    }
}

// =============================================================================
// Tier State Machine — table-driven trailing-stop regimes
// =============================================================================
//
// Each tier is one row of an ordered table:
//
//   tier_N = { profit_threshold, drawdown rule }
//
// The tier a leg sits in is derived purely from its high-water mark: the
// highest row whose threshold is <= the peak profit. Per evaluation step:
//
//   1. If the leg already holds a tier and is not net negative, that tier's
//      drawdown rule is tested against the current profit.
//   2. Only when the rule did not fire is the tier re-derived from the
//      (already updated) high-water mark. Tiers never move down.
//
// Testing the prior tier first means a single spike can never promote a leg
// and liquidate it from the new tier in the same step.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Absorbs binary representation noise at the exact drawdown boundary.
const BOUNDARY_EPSILON: f64 = 1e-9;

// =============================================================================
// Drawdown rules
// =============================================================================

/// How far profit may retreat from its peak before a tier liquidates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrawdownRule {
    /// Close when `current <= highest * (1 - fraction)`.
    Proportional { fraction: f64 },
    /// Close when `highest - current >= points` (percentage points).
    Fixed { points: f64 },
}

impl DrawdownRule {
    /// Whether this rule fires for the given peak / current profit (both in %).
    pub fn triggered(&self, highest_pct: f64, current_pct: f64) -> bool {
        match *self {
            Self::Proportional { fraction } => {
                current_pct <= highest_pct * (1.0 - fraction) + BOUNDARY_EPSILON
            }
            Self::Fixed { points } => highest_pct - current_pct + BOUNDARY_EPSILON >= points,
        }
    }
}

impl std::fmt::Display for DrawdownRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proportional { fraction } => write!(f, "proportional {:.0}%", fraction * 100.0),
            Self::Fixed { points } => write!(f, "fixed {points:.2}pt"),
        }
    }
}

/// One row of the tier table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    /// Peak profit (%) at which this tier becomes active.
    pub profit_threshold: f64,
    pub drawdown: DrawdownRule,
}

impl TierSpec {
    pub const fn proportional(profit_threshold: f64, fraction: f64) -> Self {
        Self {
            profit_threshold,
            drawdown: DrawdownRule::Proportional { fraction },
        }
    }

    pub const fn fixed(profit_threshold: f64, points: f64) -> Self {
        Self {
            profit_threshold,
            drawdown: DrawdownRule::Fixed { points },
        }
    }
}

/// The eleven stock tiers.
pub fn default_tiers() -> Vec<TierSpec> {
    vec![
        TierSpec::proportional(0.7, 0.2),
        TierSpec::fixed(1.0, 0.2),
        TierSpec::fixed(1.3, 0.3),
        TierSpec::fixed(1.5, 0.3),
        TierSpec::proportional(2.0, 0.3),
        TierSpec::proportional(2.5, 0.3),
        TierSpec::proportional(3.0, 0.25),
        TierSpec::proportional(4.0, 0.25),
        TierSpec::proportional(5.0, 0.2),
        TierSpec::proportional(7.5, 0.2),
        TierSpec::proportional(10.0, 0.2),
    ]
}

// =============================================================================
// Tier level
// =============================================================================

/// 1-based position of a row in the tier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TierLevel(u8);

impl TierLevel {
    pub fn new(level: u8) -> Option<Self> {
        (level > 0).then_some(Self(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl std::fmt::Display for TierLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier_{}", self.0)
    }
}

/// Render an optional tier, `none` when unassigned.
pub fn tier_label(tier: Option<TierLevel>) -> String {
    tier.map_or_else(|| "none".to_string(), |t| t.to_string())
}

// =============================================================================
// Tier table
// =============================================================================

/// Result of one trailing-stop evaluation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailOutcome {
    /// The held tier's drawdown rule fired; the leg must be closed.
    Close { tier: TierLevel, rule: DrawdownRule },
    /// Keep the leg open; `current` is the tier to store from now on.
    Hold {
        previous: Option<TierLevel>,
        current: Option<TierLevel>,
    },
}

impl TrailOutcome {
    pub fn transitioned(&self) -> bool {
        matches!(self, Self::Hold { previous, current } if previous != current)
    }
}

/// Ordered (ascending threshold) trailing-stop table.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    tiers: Vec<TierSpec>,
}

impl TierTable {
    /// Build a table from rows already checked by `BotConfig::validate`.
    pub fn new(tiers: Vec<TierSpec>) -> Self {
        Self { tiers }
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn spec(&self, level: TierLevel) -> Option<&TierSpec> {
        self.tiers.get(level.index())
    }

    /// Highest tier whose threshold is <= `highest_pct`, `None` below the
    /// first threshold.
    pub fn tier_for(&self, highest_pct: f64) -> Option<TierLevel> {
        self.tiers
            .iter()
            .rposition(|t| t.profit_threshold <= highest_pct)
            .and_then(|idx| u8::try_from(idx + 1).ok())
            .and_then(TierLevel::new)
    }

    /// Tier assigned when a surviving leg is promoted straight into trailing
    /// mode after its partner was cut. Never lowers an existing tier.
    pub fn promote(&self, held: Option<TierLevel>, highest_pct: f64) -> Option<TierLevel> {
        held.max(self.tier_for(highest_pct))
    }

    /// One trailing-stop step. `highest_pct` must already include `current_pct`.
    pub fn step(&self, held: Option<TierLevel>, highest_pct: f64, current_pct: f64) -> TrailOutcome {
        if let Some(tier) = held {
            if current_pct >= 0.0 {
                if let Some(spec) = self.spec(tier) {
                    if spec.drawdown.triggered(highest_pct, current_pct) {
                        return TrailOutcome::Close {
                            tier,
                            rule: spec.drawdown,
                        };
                    }
                }
            }
        }

        TrailOutcome::Hold {
            previous: held,
            current: self.promote(held, highest_pct),
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(default_tiers())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn level(n: u8) -> TierLevel {
        TierLevel::new(n).unwrap()
    }

    #[test]
    fn lookup_picks_highest_reached_threshold() {
        let table = TierTable::default();
        assert_eq!(table.tier_for(0.0), None);
        assert_eq!(table.tier_for(0.69), None);
        assert_eq!(table.tier_for(0.7), Some(level(1)));
        assert_eq!(table.tier_for(0.99), Some(level(1)));
        assert_eq!(table.tier_for(1.0), Some(level(2)));
        assert_eq!(table.tier_for(2.0), Some(level(5)));
        assert_eq!(table.tier_for(7.5), Some(level(10)));
        assert_eq!(table.tier_for(50.0), Some(level(11)));
    }

    #[test]
    fn lookup_is_path_independent() {
        let table = TierTable::default();
        let mut held = None;
        for hwm in [0.2, 0.9, 1.4, 1.6, 2.6] {
            held = table.promote(held, hwm);
        }
        assert_eq!(held, table.tier_for(2.6));
        assert_eq!(table.promote(None, 2.6), held);
    }

    #[test]
    fn tier_one_closes_at_twenty_percent_retreat() {
        let table = TierTable::default();
        let at_boundary = table.step(Some(level(1)), 1.0, 0.8);
        assert!(
            matches!(at_boundary, TrailOutcome::Close { tier, .. } if tier == level(1)),
            "0.8 is exactly 20% below a 1.0 peak and must close, got {at_boundary:?}"
        );

        let above = table.step(Some(level(1)), 1.0, 0.81);
        assert!(
            matches!(above, TrailOutcome::Hold { .. }),
            "0.81 is inside the 20% band and must hold, got {above:?}"
        );
    }

    #[test]
    fn fixed_tier_closes_on_point_retreat() {
        let table = TierTable::default();
        // tier_3: fixed 0.3 points.
        assert!(matches!(
            table.step(Some(level(3)), 1.4, 1.1),
            TrailOutcome::Close { .. }
        ));
        assert!(matches!(
            table.step(Some(level(3)), 1.4, 1.11),
            TrailOutcome::Hold { .. }
        ));
    }

    #[test]
    fn negative_profit_never_triggers_trailing_close() {
        let table = TierTable::default();
        let outcome = table.step(Some(level(1)), 1.0, -0.3);
        assert!(matches!(outcome, TrailOutcome::Hold { .. }));
    }

    #[test]
    fn spike_promotes_without_closing_from_new_tier() {
        let table = TierTable::default();
        // Held tier_1, peak jumps to 2.0 and current is 1.9: tier_1 rule
        // (<= 1.6) does not fire, so the leg is promoted to tier_5 and held.
        let outcome = table.step(Some(level(1)), 2.0, 1.9);
        assert_eq!(
            outcome,
            TrailOutcome::Hold {
                previous: Some(level(1)),
                current: Some(level(5)),
            }
        );
        assert!(outcome.transitioned());
    }

    #[test]
    fn unassigned_leg_is_only_promoted() {
        let table = TierTable::default();
        let outcome = table.step(None, 0.75, 0.1);
        assert_eq!(
            outcome,
            TrailOutcome::Hold {
                previous: None,
                current: Some(level(1)),
            }
        );
    }

    #[test]
    fn tiers_never_demote() {
        let table = TierTable::default();
        assert_eq!(table.promote(Some(level(6)), 1.0), Some(level(6)));
        let outcome = table.step(Some(level(6)), 1.0, 0.95);
        assert_eq!(
            outcome,
            TrailOutcome::Hold {
                previous: Some(level(6)),
                current: Some(level(6)),
            }
        );
        assert!(!outcome.transitioned());
    }

    #[test]
    fn drawdown_rules_deserialise_from_tagged_json() {
        let json = r#"[
            {"profit_threshold": 0.7, "drawdown": {"kind": "proportional", "fraction": 0.2}},
            {"profit_threshold": 1.0, "drawdown": {"kind": "fixed", "points": 0.2}}
        ]"#;
        let rows: Vec<TierSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(rows, default_tiers()[..2].to_vec());
    }

    #[test]
    fn labels_render_as_expected() {
        assert_eq!(tier_label(None), "none");
        assert_eq!(tier_label(Some(level(11))), "tier_11");
        assert!(TierLevel::new(0).is_none());
    }
}

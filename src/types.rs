// =============================================================================
// Shared types used across the hedge engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One side of a hedge position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Long, Side::Short];

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Order side that opens exposure on this leg.
    pub fn open_order_side(self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side that reduces exposure on this leg.
    pub fn close_order_side(self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    /// `positionSide` value used by dual-direction position mode.
    pub fn position_side(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Order type sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Market,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
        }
    }
}

/// A single nonzero position as reported by the exchange.
///
/// Positive `position_amt` is long exposure, negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
}

impl PositionSnapshot {
    pub fn side(&self) -> Option<Side> {
        if self.position_amt > Decimal::ZERO {
            Some(Side::Long)
        } else if self.position_amt < Decimal::ZERO {
            Some(Side::Short)
        } else {
            None
        }
    }

    /// Unsigned position size.
    pub fn amount(&self) -> Decimal {
        self.position_amt.abs()
    }
}

/// Acknowledgement of an order accepted by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
}

/// A request to open exposure on one leg.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    /// Required for `OrderKind::Limit`.
    pub price: Option<Decimal>,
}

/// Best bid / best ask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookTop {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Price and quantity increments for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
}

/// Normalise an instrument id to a Binance futures symbol.
///
/// `CTC-USDT-SWAP` becomes `CTCUSDT`; plain symbols are upper-cased.
pub fn to_binance_symbol(inst_id: &str) -> String {
    let parts: Vec<&str> = inst_id.split('-').collect();
    if parts.len() >= 2 {
        return format!("{}{}", parts[0], parts[1]).to_uppercase();
    }
    inst_id.replace(['-', '_'], "").to_uppercase()
}

// =============================================================================
// Execution Collaborator — the narrow exchange contract the engine consumes
// =============================================================================
//
// The hedge monitor and the pair opener only ever talk to the exchange through
// `FuturesExchange`. The live implementation is `BinanceFuturesClient`; tests
// drive the same code paths with a scripted in-memory exchange.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{BookTop, InstrumentFilters, OpenOrder, OrderAck, PositionSnapshot, Side};

/// Binance error code for "Order's position side does not match user's setting".
const POSITION_SIDE_MISMATCH_CODE: i64 = -4061;

/// Errors surfaced by an exchange collaborator.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The exchange answered with an error payload.
    #[error("{endpoint} returned {status} (code {code}): {msg}")]
    Api {
        endpoint: String,
        status: u16,
        code: i64,
        msg: String,
    },

    /// The request never produced a usable HTTP response.
    #[error("{endpoint} request failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The response body did not have the expected shape.
    #[error("unexpected payload from {endpoint}: {detail}")]
    Payload { endpoint: String, detail: String },

    /// The local rate-limit tracker refused to send the request.
    #[error("request refused locally: {0}")]
    RateLimited(String),
}

impl ExchangeError {
    /// Whether the error means the account is not in the position mode the
    /// request assumed (dual-direction vs single-direction).
    pub fn is_position_side_mismatch(&self) -> bool {
        match self {
            Self::Api { code, msg, .. } => {
                let lower = msg.to_lowercase();
                *code == POSITION_SIDE_MISMATCH_CODE
                    || lower.contains("positionside")
                    || lower.contains("hedge")
                    || lower.contains("reduceonly")
            }
            _ => false,
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Everything the engine needs from a USDT-margined futures venue.
#[async_trait]
pub trait FuturesExchange: Send + Sync {
    /// All nonzero positions. Positive amount = long, negative = short.
    async fn fetch_positions(&self) -> ExchangeResult<Vec<PositionSnapshot>>;

    async fn mark_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// USDT wallet balance.
    async fn account_balance(&self) -> ExchangeResult<Decimal>;

    /// Market close of `amount` on `side`, tolerant of both position modes.
    async fn close_position(
        &self,
        symbol: &str,
        amount: Decimal,
        side: Side,
    ) -> ExchangeResult<OrderAck>;

    async fn order_book_top(&self, symbol: &str) -> ExchangeResult<BookTop>;

    /// Open exposure on one leg, tolerant of both position modes.
    async fn open_order(&self, order: &OpenOrder) -> ExchangeResult<OrderAck>;

    async fn order_filled(&self, symbol: &str, order_id: u64) -> ExchangeResult<bool>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<()>;

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Tick / step sizes keyed by symbol.
    async fn instrument_filters(&self) -> ExchangeResult<HashMap<String, InstrumentFilters>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: i64, msg: &str) -> ExchangeError {
        ExchangeError::Api {
            endpoint: "POST /fapi/v1/order".into(),
            status: 400,
            code,
            msg: msg.into(),
        }
    }

    #[test]
    fn position_side_mismatch_detected_by_code() {
        assert!(api_error(-4061, "Order's position side does not match user's setting.")
            .is_position_side_mismatch());
    }

    #[test]
    fn position_side_mismatch_detected_by_message() {
        assert!(api_error(-1106, "Parameter 'reduceOnly' sent when not required.")
            .is_position_side_mismatch());
        assert!(api_error(-1, "hedge mode is off").is_position_side_mismatch());
    }

    #[test]
    fn unrelated_errors_are_not_mismatches() {
        assert!(!api_error(-2019, "Margin is insufficient.").is_position_side_mismatch());
        assert!(!ExchangeError::RateLimited("weight".into()).is_position_side_mismatch());
    }
}

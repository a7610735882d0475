// =============================================================================
// Binance USDT-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Position-mode tolerance: orders are first sent with `positionSide` (dual /
// hedge mode). When Binance answers that the account is in one-way mode the
// request is retried once without it (closes then use `reduceOnly=true`).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;
use tracing::{debug, info, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::exchange::{ExchangeError, ExchangeResult, FuturesExchange};
use crate::types::{
    BookTop, InstrumentFilters, OpenOrder, OrderAck, OrderKind, PositionSnapshot, Side,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    limits: Arc<RateLimitTracker>,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    /// * `testnet` — route requests to the futures testnet.
    pub fn new(api_key: &str, secret: impl Into<String>, testnet: bool) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL }.to_string();
        info!(base_url = %base_url, "BinanceFuturesClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            client,
            limits: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.limits
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Send one request and return the decoded JSON body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> ExchangeResult<Value> {
        let endpoint = format!("{method} {path}");
        if !self.limits.can_send_request(weight) {
            return Err(ExchangeError::RateLimited(endpoint));
        }

        let qs = if signed {
            self.signed_query(params)
        } else {
            params.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|source| ExchangeError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;

        self.limits.update_from_headers(resp.headers());
        let status = resp.status();
        let body: Value = resp.json().await.map_err(|source| ExchangeError::Transport {
            endpoint: endpoint.clone(),
            source,
        })?;

        if !status.is_success() {
            return Err(ExchangeError::Api {
                endpoint,
                status: status.as_u16(),
                code: body["code"].as_i64().unwrap_or_default(),
                msg: body["msg"].as_str().unwrap_or_default().to_string(),
            });
        }

        Ok(body)
    }

    /// POST /fapi/v1/order (signed) with local order-rate gating.
    async fn submit_order(&self, params: &str) -> ExchangeResult<OrderAck> {
        if !self.limits.can_place_order() {
            return Err(ExchangeError::RateLimited("POST /fapi/v1/order".into()));
        }
        self.limits.record_order_sent();
        let body = self.send(Method::POST, "/fapi/v1/order", params, true, 1).await?;
        parse_order_ack(&body)
    }
}

// =============================================================================
// Collaborator contract
// =============================================================================

#[async_trait]
impl FuturesExchange for BinanceFuturesClient {
    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "binance::fetch_positions")]
    async fn fetch_positions(&self) -> ExchangeResult<Vec<PositionSnapshot>> {
        let body = self
            .send(Method::GET, "/fapi/v2/positionRisk", "", true, 5)
            .await?;
        let positions = parse_positions(&body)?;
        debug!(count = positions.len(), "nonzero positions retrieved");
        Ok(positions)
    }

    /// GET /fapi/v1/ticker/price (public).
    #[instrument(skip(self), name = "binance::mark_price")]
    async fn mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let body = self
            .send(
                Method::GET,
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
                false,
                1,
            )
            .await?;
        decimal_field(&body, "price", "GET /fapi/v1/ticker/price")
    }

    /// GET /fapi/v2/balance (signed) — USDT wallet balance.
    #[instrument(skip(self), name = "binance::account_balance")]
    async fn account_balance(&self) -> ExchangeResult<Decimal> {
        let body = self.send(Method::GET, "/fapi/v2/balance", "", true, 5).await?;
        let assets = body.as_array().ok_or_else(|| ExchangeError::Payload {
            endpoint: "GET /fapi/v2/balance".into(),
            detail: "expected an array of assets".into(),
        })?;

        for asset in assets {
            if asset["asset"].as_str() == Some("USDT") {
                let balance = decimal_field(asset, "balance", "GET /fapi/v2/balance")?;
                debug!(%balance, "USDT balance retrieved");
                return Ok(balance);
            }
        }

        warn!("USDT not found in futures balances — returning 0");
        Ok(Decimal::ZERO)
    }

    #[instrument(skip(self), name = "binance::close_position")]
    async fn close_position(
        &self,
        symbol: &str,
        amount: Decimal,
        side: Side,
    ) -> ExchangeResult<OrderAck> {
        let base = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={}",
            side.close_order_side(),
            fmt_decimal(amount.abs())
        );

        let dual = format!("{base}&positionSide={}", side.position_side());
        match self.submit_order(&dual).await {
            Ok(ack) => Ok(ack),
            Err(e) if e.is_position_side_mismatch() => {
                warn!(symbol, %side, error = %e, "dual-mode close rejected — retrying in one-way mode");
                self.submit_order(&format!("{base}&reduceOnly=true")).await
            }
            Err(e) => Err(e),
        }
    }

    /// GET /fapi/v1/depth (public), limit 5.
    #[instrument(skip(self), name = "binance::order_book_top")]
    async fn order_book_top(&self, symbol: &str) -> ExchangeResult<BookTop> {
        let body = self
            .send(
                Method::GET,
                "/fapi/v1/depth",
                &format!("symbol={symbol}&limit=5"),
                false,
                2,
            )
            .await?;
        parse_book_top(&body)
    }

    #[instrument(skip(self), name = "binance::open_order")]
    async fn open_order(&self, order: &OpenOrder) -> ExchangeResult<OrderAck> {
        let mut base = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            order.symbol,
            order.side.open_order_side(),
            order.kind,
            fmt_decimal(order.quantity),
            client_order_id()
        );
        if order.kind == OrderKind::Limit {
            let price = order.price.ok_or_else(|| ExchangeError::Payload {
                endpoint: "POST /fapi/v1/order".into(),
                detail: "limit order without a price".into(),
            })?;
            base.push_str(&format!("&price={}&timeInForce=GTC", fmt_decimal(price)));
        }

        let dual = format!("{base}&positionSide={}", order.side.position_side());
        match self.submit_order(&dual).await {
            Ok(ack) => Ok(ack),
            Err(e) if e.is_position_side_mismatch() => {
                warn!(
                    symbol = %order.symbol,
                    side = %order.side,
                    error = %e,
                    "dual-mode open rejected — retrying in one-way mode"
                );
                self.submit_order(&base).await
            }
            Err(e) => Err(e),
        }
    }

    /// GET /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::order_filled")]
    async fn order_filled(&self, symbol: &str, order_id: u64) -> ExchangeResult<bool> {
        let body = self
            .send(
                Method::GET,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
                1,
            )
            .await?;
        Ok(body["status"].as_str() == Some("FILLED"))
    }

    /// DELETE /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<()> {
        self.send(
            Method::DELETE,
            "/fapi/v1/order",
            &format!("symbol={symbol}&orderId={order_id}"),
            true,
            1,
        )
        .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    /// DELETE /fapi/v1/allOpenOrders (signed).
    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.send(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &format!("symbol={symbol}"),
            true,
            1,
        )
        .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.send(
            Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
            true,
            1,
        )
        .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// GET /fapi/v1/exchangeInfo (public).
    #[instrument(skip(self), name = "binance::instrument_filters")]
    async fn instrument_filters(&self) -> ExchangeResult<HashMap<String, InstrumentFilters>> {
        let body = self
            .send(Method::GET, "/fapi/v1/exchangeInfo", "", false, 1)
            .await?;
        let filters = parse_instrument_filters(&body);
        info!(count = filters.len(), "futures instrument filters loaded");
        Ok(filters)
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Payload parsing
// =============================================================================

/// Render a decimal the way Binance expects it in a query string.
/// Client order id: `hg-` plus a v4 UUID without dashes (35 chars).
fn client_order_id() -> String {
    format!("hg-{}", Uuid::new_v4().simple())
}

fn fmt_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Parse a JSON value that may be either a string or a number into `Decimal`.
fn decimal_field(value: &Value, key: &str, endpoint: &str) -> ExchangeResult<Decimal> {
    let raw = &value[key];
    let parsed = match raw {
        Value::String(s) => s.parse::<Decimal>().ok(),
        Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ExchangeError::Payload {
        endpoint: endpoint.to_string(),
        detail: format!("field '{key}' is not a decimal: {raw}"),
    })
}

fn parse_positions(body: &Value) -> ExchangeResult<Vec<PositionSnapshot>> {
    const ENDPOINT: &str = "GET /fapi/v2/positionRisk";
    let entries = body.as_array().ok_or_else(|| ExchangeError::Payload {
        endpoint: ENDPOINT.into(),
        detail: "expected an array of positions".into(),
    })?;

    let mut positions = Vec::new();
    for entry in entries {
        let position_amt = decimal_field(entry, "positionAmt", ENDPOINT)?;
        if position_amt.is_zero() {
            continue;
        }
        let symbol = entry["symbol"].as_str().unwrap_or_default().to_string();
        if symbol.is_empty() {
            warn!("skipping position entry without a symbol");
            continue;
        }
        positions.push(PositionSnapshot {
            symbol,
            position_amt,
            entry_price: decimal_field(entry, "entryPrice", ENDPOINT)?,
        });
    }
    Ok(positions)
}

fn parse_order_ack(body: &Value) -> ExchangeResult<OrderAck> {
    let order_id = body["orderId"].as_u64().ok_or_else(|| ExchangeError::Payload {
        endpoint: "POST /fapi/v1/order".into(),
        detail: format!("missing orderId in {body}"),
    })?;
    Ok(OrderAck {
        order_id,
        symbol: body["symbol"].as_str().unwrap_or_default().to_string(),
        status: body["status"].as_str().unwrap_or_default().to_string(),
    })
}

fn parse_book_top(body: &Value) -> ExchangeResult<BookTop> {
    const ENDPOINT: &str = "GET /fapi/v1/depth";
    let best = |side: &str| -> ExchangeResult<Decimal> {
        body[side]
            .as_array()
            .and_then(|levels| levels.first())
            .and_then(|level| level.get(0))
            .and_then(|price| price.as_str())
            .and_then(|price| price.parse::<Decimal>().ok())
            .ok_or_else(|| ExchangeError::Payload {
                endpoint: ENDPOINT.into(),
                detail: format!("no usable {side} level"),
            })
    };
    Ok(BookTop {
        bid: best("bids")?,
        ask: best("asks")?,
    })
}

fn parse_instrument_filters(body: &Value) -> HashMap<String, InstrumentFilters> {
    let mut out = HashMap::new();
    let Some(symbols) = body["symbols"].as_array() else {
        return out;
    };

    for s in symbols {
        let Some(symbol) = s["symbol"].as_str() else {
            continue;
        };
        let mut tick_size = None;
        let mut step_size = None;
        for f in s["filters"].as_array().into_iter().flatten() {
            match f["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    tick_size = f["tickSize"].as_str().and_then(|v| v.parse::<Decimal>().ok());
                }
                Some("LOT_SIZE") => {
                    step_size = f["stepSize"].as_str().and_then(|v| v.parse::<Decimal>().ok());
                }
                _ => {}
            }
        }
        if let (Some(tick_size), Some(step_size)) = (tick_size, step_size) {
            out.insert(
                symbol.to_string(),
                InstrumentFilters {
                    tick_size,
                    step_size,
                },
            );
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

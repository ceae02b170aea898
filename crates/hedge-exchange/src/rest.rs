//! Signed REST client for a Binance-style USDⓈ-M perpetual-futures API.
//!
//! Every private call is HMAC-SHA256 signed over the query string and sent
//! with the API key header. Calls run under a bounded timeout; transient
//! failures (network, rate limit, 5xx) are retried with exponential backoff
//! before surfacing.

use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use async_trait::async_trait;
use hedge_common::{Candle, Direction, PositionAction, Side};

use crate::error::ExchangeError;
use crate::session::{ExchangeSession, SessionResult};
use crate::stream::{spawn_book_ticker_reader, spawn_user_stream_reader};
use crate::types::{
    AccountOverview, BookTicker, LeverageBracket, OpenOrder, OrderAck, OrderStatus, PositionInfo,
    SymbolRules, UserStreamEvent,
};

/// Rejection code the exchange returns when the account is already in the
/// requested position mode.
const NO_NEED_TO_CHANGE_POSITION_SIDE: i64 = -4059;

/// Connection and credential configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// REST base URL, e.g. "https://fapi.binance.com".
    pub rest_base: String,
    /// WebSocket base URL, e.g. "wss://fstream.binance.com".
    pub ws_base: String,
    pub api_key: String,
    pub api_secret: String,
    /// Signature validity window in milliseconds.
    pub recv_window_ms: u64,
    /// Per-call deadline.
    pub request_timeout: Duration,
    /// Retry attempts for transient failures.
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_base_delay_ms: u64,
}

impl SessionConfig {
    pub fn new(rest_base: String, ws_base: String, api_key: String, api_secret: String) -> Self {
        Self {
            rest_base,
            ws_base,
            api_key,
            api_secret,
            recv_window_ms: 5000,
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay_ms: 250,
        }
    }
}

/// One authenticated account on a Binance-style futures API, bound to a
/// single symbol.
#[derive(Clone)]
pub struct BinanceFuturesSession {
    http: reqwest::Client,
    config: SessionConfig,
    symbol: String,
}

impl BinanceFuturesSession {
    pub fn new(config: SessionConfig, symbol: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            symbol: symbol.into(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn encode_params(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Issue one signed request. Classifies the response into the error
    /// taxonomy; does not retry.
    async fn signed_once(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> SessionResult<Value> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("recvWindow", self.config.recv_window_ms.to_string()));
        all.push(("timestamp", Self::timestamp_ms().to_string()));

        let query = Self::encode_params(&all);
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.config.rest_base, path, query, signature
        );

        let request = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.config.api_key);

        let response = tokio::time::timeout(self.config.request_timeout, request.send())
            .await
            .map_err(|_| ExchangeError::Timeout(format!("{} deadline elapsed", path)))??;

        Self::classify_response(response).await
    }

    /// Issue one unsigned (public) request.
    async fn public_once(&self, path: &str, params: &[(&str, String)]) -> SessionResult<Value> {
        let url = if params.is_empty() {
            format!("{}{}", self.config.rest_base, path)
        } else {
            format!("{}{}?{}", self.config.rest_base, path, Self::encode_params(params))
        };

        let response = tokio::time::timeout(self.config.request_timeout, self.http.get(url).send())
            .await
            .map_err(|_| ExchangeError::Timeout(format!("{} deadline elapsed", path)))??;

        Self::classify_response(response).await
    }

    async fn classify_response(response: reqwest::Response) -> SessionResult<Value> {
        let status = response.status();
        let body = response.text().await.map_err(ExchangeError::from)?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Parse(format!("{}: {}", e, body)));
        }

        // Rate-limit and server-side statuses are retryable.
        if status == StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 418
            || status.is_server_error()
        {
            return Err(ExchangeError::Transient(format!("HTTP {}: {}", status, body)));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ExchangeError::Auth(format!("HTTP {}: {}", status, body)));
        }

        // Everything else is a typed exchange rejection with {code, msg}.
        let (code, message) = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                let code = v.get("code")?.as_i64()?;
                let msg = v.get("msg")?.as_str()?.to_string();
                Some((code, msg))
            })
            .unwrap_or((status.as_u16() as i64, body));
        Err(ExchangeError::Rejected { code, message })
    }

    /// Retry wrapper: transient errors back off exponentially, everything
    /// else surfaces immediately.
    async fn with_retry<F, Fut>(&self, operation: F) -> SessionResult<Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SessionResult<Value>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_base_delay_ms * 2u64.pow(attempt - 1);
                    warn!(attempt, delay_ms = delay, error = %e, "transient exchange error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a user-data-stream listen key.
    pub(crate) async fn create_listen_key(&self) -> SessionResult<String> {
        let url = format!("{}/fapi/v1/listenKey", self.config.rest_base);
        let request = self.http.post(url).header("X-MBX-APIKEY", &self.config.api_key);
        let response = tokio::time::timeout(self.config.request_timeout, request.send())
            .await
            .map_err(|_| ExchangeError::Timeout("listenKey deadline elapsed".into()))??;
        let value = Self::classify_response(response).await?;
        value
            .get("listenKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Parse("listenKey missing from response".into()))
    }

    /// Keep an existing listen key alive.
    pub(crate) async fn keepalive_listen_key(&self) -> SessionResult<()> {
        let url = format!("{}/fapi/v1/listenKey", self.config.rest_base);
        let request = self.http.put(url).header("X-MBX-APIKEY", &self.config.api_key);
        let response = tokio::time::timeout(self.config.request_timeout, request.send())
            .await
            .map_err(|_| ExchangeError::Timeout("listenKey keepalive deadline elapsed".into()))??;
        Self::classify_response(response).await.map(|_| ())
    }

    pub(crate) fn ws_base(&self) -> &str {
        &self.config.ws_base
    }
}

fn parse_dec(v: &Value, key: &str) -> SessionResult<Decimal> {
    let s = v
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::Parse(format!("missing decimal field '{}'", key)))?;
    Decimal::from_str(s).map_err(|e| ExchangeError::Parse(format!("field '{}': {}", key, e)))
}

fn parse_i64(v: &Value, key: &str) -> SessionResult<i64> {
    v.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ExchangeError::Parse(format!("missing integer field '{}'", key)))
}

fn parse_str<'a>(v: &'a Value, key: &str) -> SessionResult<&'a str> {
    v.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::Parse(format!("missing string field '{}'", key)))
}

fn parse_side(v: &Value) -> SessionResult<Side> {
    match parse_str(v, "side")? {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(ExchangeError::Parse(format!("unknown side '{}'", other))),
    }
}

fn array_dec(v: &Value) -> SessionResult<Decimal> {
    let s = v
        .as_str()
        .ok_or_else(|| ExchangeError::Parse("expected string in kline array".into()))?;
    Decimal::from_str(s).map_err(|e| ExchangeError::Parse(e.to_string()))
}

#[async_trait]
impl ExchangeSession for BinanceFuturesSession {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn place_limit_order(
        &self,
        direction: Direction,
        _action: PositionAction,
        side: Side,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> SessionResult<OrderAck> {
        // In hedge mode the (side, positionSide) pair encodes open vs close;
        // no reduceOnly flag is sent.
        let params = [
            ("symbol", self.symbol.clone()),
            ("side", side.as_str().to_string()),
            ("positionSide", direction.position_side().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", qty.to_string()),
            ("price", price.to_string()),
            ("newClientOrderId", client_id.to_string()),
        ];

        // No blanket retry: a timed-out placement has unknown state and must
        // be reconciled by the caller, not resubmitted.
        let v = self.signed_once(Method::POST, "/fapi/v1/order", &params).await?;

        Ok(OrderAck {
            order_id: parse_i64(&v, "orderId")?,
            client_order_id: parse_str(&v, "clientOrderId")?.to_string(),
            side,
            price,
            qty,
            status: OrderStatus::from_wire(parse_str(&v, "status")?),
        })
    }

    async fn cancel_order(&self, order_id: i64) -> SessionResult<()> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", order_id.to_string()),
        ];
        self.with_retry(|| self.signed_once(Method::DELETE, "/fapi/v1/order", &params))
            .await
            .map(|_| ())
    }

    async fn cancel_all(&self) -> SessionResult<()> {
        let params = [("symbol", self.symbol.clone())];
        self.with_retry(|| self.signed_once(Method::DELETE, "/fapi/v1/allOpenOrders", &params))
            .await
            .map(|_| ())
    }

    async fn close_position_market(&self, direction: Direction, qty: Decimal) -> SessionResult<()> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("side", direction.close_side().as_str().to_string()),
            ("positionSide", direction.position_side().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.to_string()),
        ];
        self.signed_once(Method::POST, "/fapi/v1/order", &params)
            .await
            .map(|_| ())
    }

    async fn open_orders(&self) -> SessionResult<Vec<OpenOrder>> {
        let params = [("symbol", self.symbol.clone())];
        let v = self
            .with_retry(|| self.signed_once(Method::GET, "/fapi/v1/openOrders", &params))
            .await?;

        let rows = v
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("openOrders: expected array".into()))?;
        rows.iter()
            .map(|row| {
                Ok(OpenOrder {
                    order_id: parse_i64(row, "orderId")?,
                    client_order_id: parse_str(row, "clientOrderId")?.to_string(),
                    side: parse_side(row)?,
                    price: parse_dec(row, "price")?,
                    orig_qty: parse_dec(row, "origQty")?,
                    executed_qty: parse_dec(row, "executedQty")?,
                    status: OrderStatus::from_wire(parse_str(row, "status")?),
                })
            })
            .collect()
    }

    async fn positions(&self) -> SessionResult<Vec<PositionInfo>> {
        let params = [("symbol", self.symbol.clone())];
        let v = self
            .with_retry(|| self.signed_once(Method::GET, "/fapi/v2/positionRisk", &params))
            .await?;

        let rows = v
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("positionRisk: expected array".into()))?;
        rows.iter()
            .map(|row| {
                Ok(PositionInfo {
                    position_side: parse_str(row, "positionSide")?.to_string(),
                    qty: parse_dec(row, "positionAmt")?,
                    entry_price: parse_dec(row, "entryPrice")?,
                    unrealized_pnl: parse_dec(row, "unRealizedProfit")?,
                    leverage: parse_str(row, "leverage")?
                        .parse()
                        .map_err(|_| ExchangeError::Parse("leverage not an integer".into()))?,
                })
            })
            .collect()
    }

    async fn balance(&self, asset: &str) -> SessionResult<Decimal> {
        let v = self
            .with_retry(|| self.signed_once(Method::GET, "/fapi/v2/balance", &[]))
            .await?;

        let rows = v
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("balance: expected array".into()))?;
        for row in rows {
            if parse_str(row, "asset")? == asset {
                return parse_dec(row, "balance");
            }
        }
        Err(ExchangeError::Parse(format!("asset '{}' not in balance response", asset)))
    }

    async fn account_overview(&self) -> SessionResult<AccountOverview> {
        let v = self
            .with_retry(|| self.signed_once(Method::GET, "/fapi/v2/account", &[]))
            .await?;

        Ok(AccountOverview {
            margin_balance: parse_dec(&v, "totalMarginBalance")?,
            maintenance_margin: parse_dec(&v, "totalMaintMargin")?,
            unrealized_pnl: parse_dec(&v, "totalUnrealizedProfit")?,
        })
    }

    async fn set_leverage(&self, leverage: u32) -> SessionResult<()> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("leverage", leverage.to_string()),
        ];
        self.with_retry(|| self.signed_once(Method::POST, "/fapi/v1/leverage", &params))
            .await
            .map(|_| ())
    }

    async fn set_hedge_mode(&self) -> SessionResult<()> {
        let params = [("dualSidePosition", "true".to_string())];
        match self
            .signed_once(Method::POST, "/fapi/v1/positionSide/dual", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::Rejected { code, .. }) if code == NO_NEED_TO_CHANGE_POSITION_SIDE => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_ohlcv(&self, timeframe: &str, limit: u32) -> SessionResult<Vec<Candle>> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        let v = self.public_once("/fapi/v1/klines", &params).await?;

        let rows = v
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("klines: expected array".into()))?;
        rows.iter()
            .map(|row| {
                let cells = row
                    .as_array()
                    .filter(|c| c.len() >= 6)
                    .ok_or_else(|| ExchangeError::Parse("kline row too short".into()))?;
                let open_ms = cells[0]
                    .as_i64()
                    .ok_or_else(|| ExchangeError::Parse("kline open time".into()))?;
                Ok(Candle {
                    open_time: Utc
                        .timestamp_millis_opt(open_ms)
                        .single()
                        .ok_or_else(|| ExchangeError::Parse("kline open time out of range".into()))?,
                    open: array_dec(&cells[1])?,
                    high: array_dec(&cells[2])?,
                    low: array_dec(&cells[3])?,
                    close: array_dec(&cells[4])?,
                    volume: array_dec(&cells[5])?,
                })
            })
            .collect()
    }

    async fn symbol_rules(&self) -> SessionResult<SymbolRules> {
        let v = self.public_once("/fapi/v1/exchangeInfo", &[]).await?;

        let symbols = v
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Parse("exchangeInfo: symbols missing".into()))?;
        let info = symbols
            .iter()
            .find(|s| s.get("symbol").and_then(Value::as_str) == Some(self.symbol.as_str()))
            .ok_or_else(|| ExchangeError::Parse(format!("symbol '{}' not listed", self.symbol)))?;

        let filters = info
            .get("filters")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Parse("exchangeInfo: filters missing".into()))?;

        let mut tick_size = None;
        let mut lot_size = None;
        let mut min_notional = None;
        for f in filters {
            match f.get("filterType").and_then(Value::as_str) {
                Some("PRICE_FILTER") => tick_size = Some(parse_dec(f, "tickSize")?),
                Some("LOT_SIZE") => lot_size = Some(parse_dec(f, "stepSize")?),
                Some("MIN_NOTIONAL") => min_notional = Some(parse_dec(f, "notional")?),
                _ => {}
            }
        }

        Ok(SymbolRules {
            symbol: self.symbol.clone(),
            tick_size: tick_size
                .ok_or_else(|| ExchangeError::Parse("PRICE_FILTER missing".into()))?,
            lot_size: lot_size.ok_or_else(|| ExchangeError::Parse("LOT_SIZE missing".into()))?,
            min_notional: min_notional
                .ok_or_else(|| ExchangeError::Parse("MIN_NOTIONAL missing".into()))?,
        })
    }

    async fn leverage_brackets(&self) -> SessionResult<Vec<LeverageBracket>> {
        let params = [("symbol", self.symbol.clone())];
        let v = self
            .with_retry(|| self.signed_once(Method::GET, "/fapi/v1/leverageBracket", &params))
            .await?;

        // Response is [{symbol, brackets: [...]}]; take the first entry.
        let brackets = v
            .as_array()
            .and_then(|a| a.first())
            .and_then(|e| e.get("brackets"))
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Parse("leverageBracket: brackets missing".into()))?;

        let mut out: Vec<LeverageBracket> = brackets
            .iter()
            .map(|b| {
                let floor = b
                    .get("notionalFloor")
                    .and_then(Value::as_f64)
                    .map(|f| Decimal::try_from(f).unwrap_or_default());
                let cap = b
                    .get("notionalCap")
                    .and_then(Value::as_f64)
                    .map(|f| Decimal::try_from(f).unwrap_or_default());
                Ok(LeverageBracket {
                    notional_floor: floor
                        .ok_or_else(|| ExchangeError::Parse("notionalFloor missing".into()))?,
                    notional_cap: cap
                        .ok_or_else(|| ExchangeError::Parse("notionalCap missing".into()))?,
                    maintenance_margin_ratio: b
                        .get("maintMarginRatio")
                        .and_then(Value::as_f64)
                        .map(|f| Decimal::try_from(f).unwrap_or_default())
                        .ok_or_else(|| ExchangeError::Parse("maintMarginRatio missing".into()))?,
                    max_leverage: b
                        .get("initialLeverage")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| ExchangeError::Parse("initialLeverage missing".into()))?
                        as u32,
                })
            })
            .collect::<SessionResult<_>>()?;
        out.sort_by(|a, b| a.notional_floor.cmp(&b.notional_floor));
        Ok(out)
    }

    async fn subscribe_user_stream(&self) -> SessionResult<mpsc::Receiver<UserStreamEvent>> {
        spawn_user_stream_reader(self).await
    }

    async fn subscribe_book_ticker(&self) -> SessionResult<watch::Receiver<Option<BookTicker>>> {
        spawn_book_ticker_reader(self.ws_base(), &self.symbol).await
    }
}

//! Self-healing WebSocket readers for the private user-data stream and the
//! public book-ticker stream.
//!
//! Both readers reconnect forever with capped exponential backoff. The user
//! stream additionally re-keys its listen-key authentication on reconnect and
//! emits a synthetic [`UserStreamEvent::Resync`] so the consumer reconciles
//! local state against snapshot queries before trusting further deltas.

use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use hedge_common::Side;

use crate::error::ExchangeError;
use crate::rest::BinanceFuturesSession;
use crate::session::SessionResult;
use crate::types::{
    BalanceUpdate, BookTicker, OrderStatus, OrderUpdate, PositionUpdate, UserStreamEvent,
};

/// Listen-key refresh cadence; the exchange expires keys after 60 minutes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Start the user-data-stream reader for `session`.
///
/// Fails fast if the initial listen key cannot be created; after that the
/// spawned task owns reconnection and re-keying.
pub(crate) async fn spawn_user_stream_reader(
    session: &BinanceFuturesSession,
) -> SessionResult<mpsc::Receiver<UserStreamEvent>> {
    let initial_key = session.create_listen_key().await?;

    let rest = session.clone();
    let ws_base = session.ws_base().to_string();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(user_stream_loop(rest, ws_base, initial_key, tx));
    Ok(rx)
}

async fn user_stream_loop(
    rest: BinanceFuturesSession,
    ws_base: String,
    initial_key: String,
    tx: mpsc::Sender<UserStreamEvent>,
) {
    let mut listen_key = initial_key;
    let mut backoff = RECONNECT_BASE_DELAY;
    let mut first_connect = true;

    loop {
        let raw_url = format!("{}/ws/{}", ws_base.trim_end_matches('/'), listen_key);
        let url = match Url::parse(&raw_url) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "bad user-stream url, reader exiting");
                return;
            }
        };

        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                info!("user data stream connected");
                backoff = RECONNECT_BASE_DELAY;

                if !first_connect && tx.send(UserStreamEvent::Resync).await.is_err() {
                    return;
                }
                first_connect = false;

                let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
                keepalive.tick().await; // consume the immediate first tick

                loop {
                    tokio::select! {
                        _ = keepalive.tick() => {
                            if let Err(e) = rest.keepalive_listen_key().await {
                                warn!(error = %e, "listen key keepalive failed");
                            }
                        }
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_user_event(text.as_str()) {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                } else if is_listen_key_expired(text.as_str()) {
                                    warn!("listen key expired, re-keying");
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "user stream read error");
                                break;
                            }
                            None => {
                                warn!("user stream closed by peer");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "user stream connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);

        // Re-key authentication before the next attempt; on failure keep the
        // old key and let the connect attempt surface the problem.
        match rest.create_listen_key().await {
            Ok(key) => listen_key = key,
            Err(e) => warn!(error = %e, "listen key renewal failed"),
        }
    }
}

/// Start the public book-ticker reader for `symbol`.
pub(crate) async fn spawn_book_ticker_reader(
    ws_base: &str,
    symbol: &str,
) -> SessionResult<watch::Receiver<Option<BookTicker>>> {
    let raw_url = format!(
        "{}/ws/{}@bookTicker",
        ws_base.trim_end_matches('/'),
        symbol.to_ascii_lowercase()
    );
    let url =
        Url::parse(&raw_url).map_err(|e| ExchangeError::StreamDisconnect(e.to_string()))?;

    let (tx, rx) = watch::channel(None);
    tokio::spawn(book_ticker_loop(url, tx));
    Ok(rx)
}

async fn book_ticker_loop(url: Url, tx: watch::Sender<Option<BookTicker>>) {
    let mut backoff = RECONNECT_BASE_DELAY;

    loop {
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                debug!("book ticker stream connected");
                backoff = RECONNECT_BASE_DELAY;

                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            if let Some(ticker) = parse_book_ticker(text.as_str()) {
                                if tx.send(Some(ticker)).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "book ticker read error");
                            break;
                        }
                    }
                }
                warn!("book ticker stream disconnected");
            }
            Err(e) => {
                warn!(error = %e, "book ticker connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(default, rename = "e")]
    event: Option<String>,
    #[serde(default, rename = "E")]
    event_time: Option<i64>,
    #[serde(default, rename = "o")]
    order: Option<WsOrder>,
    #[serde(default, rename = "a")]
    account: Option<WsAccount>,
}

#[derive(Debug, Deserialize)]
struct WsOrder {
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(default, rename = "l")]
    last_fill_qty: Option<String>,
    #[serde(default, rename = "z")]
    cum_filled_qty: Option<String>,
    #[serde(default, rename = "ap")]
    avg_fill_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsAccount {
    #[serde(default, rename = "B")]
    balances: Vec<WsBalance>,
    #[serde(default, rename = "P")]
    positions: Vec<WsPosition>,
}

#[derive(Debug, Deserialize)]
struct WsBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "wb")]
    wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct WsPosition {
    #[serde(rename = "ps")]
    position_side: String,
    #[serde(rename = "pa")]
    qty: String,
    #[serde(rename = "ep")]
    entry_price: String,
    #[serde(default, rename = "up")]
    unrealized_pnl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsBookTicker {
    #[serde(rename = "b")]
    best_bid: String,
    #[serde(rename = "a")]
    best_ask: String,
    #[serde(default, rename = "E")]
    event_time: Option<i64>,
}

fn dec_or_zero(s: Option<&str>) -> Decimal {
    s.and_then(|s| Decimal::from_str(s).ok()).unwrap_or(Decimal::ZERO)
}

fn parse_user_event(text: &str) -> Option<UserStreamEvent> {
    let envelope: WsEnvelope = serde_json::from_str(text).ok()?;
    let event_time = envelope
        .event_time
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    match envelope.event.as_deref() {
        Some("ORDER_TRADE_UPDATE") => {
            let o = envelope.order?;
            let side = match o.side.as_str() {
                "BUY" => Side::Buy,
                "SELL" => Side::Sell,
                _ => return None,
            };
            Some(UserStreamEvent::Order(OrderUpdate {
                order_id: o.order_id,
                client_order_id: o.client_order_id,
                side,
                status: OrderStatus::from_wire(&o.status),
                price: dec_or_zero(Some(&o.price)),
                last_fill_qty: dec_or_zero(o.last_fill_qty.as_deref()),
                cum_filled_qty: dec_or_zero(o.cum_filled_qty.as_deref()),
                avg_fill_price: dec_or_zero(o.avg_fill_price.as_deref()),
                event_time,
            }))
        }
        Some("ACCOUNT_UPDATE") => {
            let a = envelope.account?;
            // Balance changes take precedence; position rows ride along in
            // the same envelope and are forwarded one at a time.
            if let Some(b) = a.balances.into_iter().next() {
                return Some(UserStreamEvent::Balance(BalanceUpdate {
                    asset: b.asset,
                    wallet_balance: dec_or_zero(Some(&b.wallet_balance)),
                }));
            }
            let p = a.positions.into_iter().next()?;
            Some(UserStreamEvent::Position(PositionUpdate {
                position_side: p.position_side,
                qty: dec_or_zero(Some(&p.qty)),
                entry_price: dec_or_zero(Some(&p.entry_price)),
                unrealized_pnl: dec_or_zero(p.unrealized_pnl.as_deref()),
            }))
        }
        _ => None,
    }
}

fn is_listen_key_expired(text: &str) -> bool {
    serde_json::from_str::<WsEnvelope>(text)
        .ok()
        .and_then(|e| e.event)
        .as_deref()
        == Some("listenKeyExpired")
}

fn parse_book_ticker(text: &str) -> Option<BookTicker> {
    let t: WsBookTicker = serde_json::from_str(text).ok()?;
    let best_bid = Decimal::from_str(&t.best_bid).ok()?;
    let best_ask = Decimal::from_str(&t.best_ask).ok()?;
    if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO {
        return None;
    }
    Some(BookTicker {
        best_bid,
        best_ask,
        event_time: t
            .event_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_order_trade_update() {
        let text = r#"{
            "e": "ORDER_TRADE_UPDATE", "E": 1700000000000,
            "o": {"s": "DOGEUSDC", "c": "hg-1-3-0", "S": "BUY", "X": "FILLED",
                  "i": 42, "p": "0.99740", "l": "10", "z": "10", "ap": "0.99735", "x": "TRADE"}
        }"#;
        match parse_user_event(text) {
            Some(UserStreamEvent::Order(u)) => {
                assert_eq!(u.order_id, 42);
                assert_eq!(u.client_order_id, "hg-1-3-0");
                assert_eq!(u.side, Side::Buy);
                assert_eq!(u.status, OrderStatus::Filled);
                assert_eq!(u.cum_filled_qty, dec!(10));
                assert_eq!(u.avg_fill_price, dec!(0.99735));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_account_update_balance() {
        let text = r#"{
            "e": "ACCOUNT_UPDATE", "E": 1700000000000,
            "a": {"B": [{"a": "USDC", "wb": "812.5", "cw": "812.5"}], "P": []}
        }"#;
        match parse_user_event(text) {
            Some(UserStreamEvent::Balance(b)) => {
                assert_eq!(b.asset, "USDC");
                assert_eq!(b.wallet_balance, dec!(812.5));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_account_update_position() {
        let text = r#"{
            "e": "ACCOUNT_UPDATE", "E": 1700000000000,
            "a": {"B": [], "P": [{"s": "DOGEUSDC", "ps": "LONG", "pa": "30", "ep": "0.99740", "up": "0.12"}]}
        }"#;
        match parse_user_event(text) {
            Some(UserStreamEvent::Position(p)) => {
                assert_eq!(p.position_side, "LONG");
                assert_eq!(p.qty, dec!(30));
                assert_eq!(p.unrealized_pnl, dec!(0.12));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_ignored() {
        assert!(parse_user_event(r#"{"e": "MARGIN_CALL"}"#).is_none());
        assert!(parse_user_event("not json").is_none());
    }

    #[test]
    fn test_listen_key_expiry_detected() {
        assert!(is_listen_key_expired(r#"{"e": "listenKeyExpired", "E": 1}"#));
        assert!(!is_listen_key_expired(r#"{"e": "bookTicker"}"#));
    }

    #[test]
    fn test_parse_book_ticker() {
        let text = r#"{"e":"bookTicker","u":1,"E":1700000000000,"s":"DOGEUSDC","b":"0.99990","B":"5000","a":"1.00010","A":"4000"}"#;
        let t = parse_book_ticker(text).unwrap();
        assert_eq!(t.best_bid, dec!(0.99990));
        assert_eq!(t.best_ask, dec!(1.00010));
        assert_eq!(t.mid(), dec!(1.00000));
    }

    #[test]
    fn test_book_ticker_rejects_empty_book() {
        let text = r#"{"b":"0","a":"1.0"}"#;
        assert!(parse_book_ticker(text).is_none());
    }
}

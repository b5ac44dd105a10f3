//! Bitfinex adapter: sequence-all protocol, chanId-routed multiplexing of a
//! single public WebSocket connection into a book feed and a trade feed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tungstenite::Message;

use crate::exchanges::util::signed_amount_to_side_and_quantity;
use crate::listener::{ChannelSlot, DialError, Listener, FEED_CHANNEL_CAPACITY};
use crate::logging;
use crate::model::{BookUpdate, PriceLevel, Side, Trade};
use crate::time::Timestamp;

const WS_ENDPOINT: &str = "wss://api-pub.bitfinex.com/ws/2";
const SEQ_ALL_FLAG: u64 = 98304;
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Book,
    Trades,
}

struct Shared {
    write: Mutex<Option<SplitSink<WsStream, Message>>>,
    book_out: Mutex<Option<mpsc::Sender<BookUpdate>>>,
    trade_out: Mutex<Option<mpsc::Sender<Vec<Trade>>>>,
}

pub struct BitfinexListener {
    symbol: String,
    shared: Arc<Shared>,
    book_slot: ChannelSlot<BookUpdate>,
    trade_slot: ChannelSlot<Vec<Trade>>,
}

impl BitfinexListener {
    pub fn new(symbol: &str) -> Self {
        BitfinexListener {
            symbol: symbol.to_string(),
            shared: Arc::new(Shared {
                write: Mutex::new(None),
                book_out: Mutex::new(None),
                trade_out: Mutex::new(None),
            }),
            book_slot: ChannelSlot::new(),
            trade_slot: ChannelSlot::new(),
        }
    }

    fn wire_symbol(&self) -> String {
        format!("t{}", self.symbol.to_uppercase())
    }
}

#[async_trait]
impl Listener for BitfinexListener {
    fn exchange(&self) -> &str {
        "Bitfinex"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), DialError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(WS_ENDPOINT).await?;
        let (mut sink, stream) = ws_stream.split();

        let conf = json!({ "event": "conf", "flags": SEQ_ALL_FLAG });
        sink.send(Message::Text(conf.to_string()))
            .await
            .map_err(DialError::Connect)?;

        *self.shared.write.lock().await = Some(sink);

        logging::info_starting(self.exchange(), self.symbol());

        spawn_tasks(
            stream,
            self.shared.clone(),
            cancel,
            self.exchange().to_string(),
            self.symbol().to_string(),
        );

        Ok(())
    }

    async fn book(&self) -> Option<mpsc::Receiver<BookUpdate>> {
        let (tx, rx) = self.book_slot.subscribe_once(FEED_CHANNEL_CAPACITY).await?;
        *self.shared.book_out.lock().await = Some(tx);

        let subscribe = json!({
            "event": "subscribe",
            "channel": "book",
            "symbol": self.wire_symbol(),
            "prec": "P0",
            "freq": "F0",
            "len": "250",
        });
        send_json(&self.shared, &subscribe).await;
        Some(rx)
    }

    async fn trades(&self) -> Option<mpsc::Receiver<Vec<Trade>>> {
        let (tx, rx) = self.trade_slot.subscribe_once(FEED_CHANNEL_CAPACITY).await?;
        *self.shared.trade_out.lock().await = Some(tx);

        let subscribe = json!({
            "event": "subscribe",
            "channel": "trades",
            "symbol": self.wire_symbol(),
        });
        send_json(&self.shared, &subscribe).await;
        Some(rx)
    }
}

async fn send_json(shared: &Shared, value: &Value) {
    if let Some(sink) = shared.write.lock().await.as_mut() {
        let _ = sink.send(Message::Text(value.to_string())).await;
    }
}

/// Sends `unsubscribe {chanId}` for every channel this connection opened,
/// then closes both output slots and the socket.
async fn shutdown(channels: &HashMap<i64, Feed>, shared: &Arc<Shared>) {
    for chan_id in channels.keys() {
        let unsubscribe = json!({ "event": "unsubscribe", "chanId": chan_id });
        send_json(shared, &unsubscribe).await;
    }
    *shared.book_out.lock().await = None;
    *shared.trade_out.lock().await = None;
    if let Some(mut sink) = shared.write.lock().await.take() {
        let _ = sink.close().await;
    }
}

fn spawn_tasks(
    mut stream: SplitStream<WsStream>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    exchange: String,
    symbol: String,
) {
    tokio::spawn(async move {
        let mut channels: HashMap<i64, Feed> = HashMap::new();
        let mut next_seq: Option<u64> = None;
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    logging::info_stopping(&exchange, &symbol);
                    shutdown(&channels, &shared).await;
                    break;
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            consecutive_errors = 0;
                            handle_frame(&text, &mut channels, &mut next_seq, &shared, &exchange, &symbol).await;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            consecutive_errors = 0;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            consecutive_errors = 0;
                        }
                        Some(Err(_)) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });
}

async fn handle_frame(
    text: &str,
    channels: &mut HashMap<i64, Feed>,
    next_seq: &mut Option<u64>,
    shared: &Arc<Shared>,
    exchange: &str,
    symbol: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            logging::error_parse(exchange, symbol, &format!("malformed frame: {e}"));
            return;
        }
    };

    if value.is_object() {
        handle_event(&value, channels, exchange, symbol);
        return;
    }

    let array = match value.as_array() {
        Some(a) => a,
        None => return,
    };
    let chan_id = match array.first().and_then(Value::as_i64) {
        Some(id) => id,
        None => return,
    };

    // The SEQ_ALL sequence is connection-wide, not per channel: it must be
    // checked for every array frame before any hb/chanId-specific dispatch,
    // or interleaved channels make it look like nearly every message gaps.
    check_sequence(array, next_seq, exchange, symbol);

    if let Some(second) = array.get(1) {
        if let Some(tag) = second.as_str() {
            if tag == "hb" {
                return;
            }
            if chan_id_is_trades(channels, chan_id) {
                handle_trade_event(tag, array, shared, exchange, symbol).await;
                return;
            }
        }
    }

    handle_payload(chan_id, array, channels, shared, exchange, symbol).await;
}

fn chan_id_is_trades(channels: &HashMap<i64, Feed>, chan_id: i64) -> bool {
    matches!(channels.get(&chan_id), Some(Feed::Trades))
}

/// Borrows the underlying `Number` out of a JSON value, without routing it
/// through `as_f64`, which would lose `arbitrary_precision`'s exact text.
fn as_number(value: &Value) -> Option<&serde_json::Number> {
    match value {
        Value::Number(n) => Some(n),
        _ => None,
    }
}

fn handle_event(value: &Value, channels: &mut HashMap<i64, Feed>, exchange: &str, symbol: &str) {
    let event = value.get("event").and_then(Value::as_str).unwrap_or("");
    match event {
        "subscribed" => {
            let chan_id = value.get("chanId").and_then(Value::as_i64);
            let channel = value.get("channel").and_then(Value::as_str);
            if let (Some(chan_id), Some(channel)) = (chan_id, channel) {
                let feed = match channel {
                    "book" => Feed::Book,
                    "trades" => Feed::Trades,
                    _ => return,
                };
                channels.insert(chan_id, feed);
            }
        }
        "error" => {
            let msg = value.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
            logging::error_parse(exchange, symbol, &format!("server error: {msg}"));
        }
        _ => {}
    }
}

/// Every array frame carries the connection-wide SEQ_ALL sequence as its
/// second-to-last element. On mismatch this logs an error (not a warning —
/// it is the one gap condition the spec names an error rather than a
/// warning) and resynchronizes to `seq + 1` rather than stalling.
fn check_sequence(array: &[Value], next_seq: &mut Option<u64>, exchange: &str, symbol: &str) {
    let seq = match array.len().checked_sub(2).and_then(|i| array.get(i)).and_then(Value::as_u64) {
        Some(seq) => seq,
        None => return,
    };
    if let Some(expected) = *next_seq {
        if seq != expected {
            logging::error_parse(exchange, symbol, &format!("missing messages {expected}..{seq}"));
        }
    }
    *next_seq = Some(seq + 1);
}

/// Every data frame is `[chanId, payload, …, seq, ts]`: the timestamp is
/// always the trailing element.
async fn handle_payload(
    chan_id: i64,
    array: &[Value],
    channels: &HashMap<i64, Feed>,
    shared: &Arc<Shared>,
    exchange: &str,
    symbol: &str,
) {
    let ts = array.last().and_then(Value::as_i64);
    let feed = match channels.get(&chan_id) {
        Some(feed) => *feed,
        None => return,
    };

    let body = &array[1];
    match feed {
        Feed::Book => handle_book_payload(body, shared, exchange, symbol, ts).await,
        Feed::Trades => handle_trades_snapshot(body, shared, exchange, symbol).await,
    }
}

/// The first payload delivered on a trades channel is a snapshot array of
/// `[id, mts, signed_amount, price]` tuples, unlike every later frame which
/// arrives tagged `"te"`/`"tu"` and is handled by `handle_trade_event`.
async fn handle_trades_snapshot(body: &Value, shared: &Arc<Shared>, exchange: &str, symbol: &str) {
    let entries = match body.as_array() {
        Some(e) => e,
        None => return,
    };

    let mut trades = Vec::new();
    for entry in entries {
        let tuple = match entry.as_array() {
            Some(t) if t.len() >= 4 => t,
            _ => continue,
        };
        let trade_id = tuple[0].as_u64().unwrap_or(0);
        let occurred_millis = tuple[1].as_i64().unwrap_or(0);
        let amount = match as_number(&tuple[2]) {
            Some(n) => n,
            None => continue,
        };
        let price = match as_number(&tuple[3]) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let (taker, quantity) = signed_amount_to_side_and_quantity(amount);

        let now = Timestamp::now();
        trades.push(Trade {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            timestamp: now,
            received: now,
            occurred: Timestamp::from_millis(occurred_millis),
            trade_id,
            buy_order_id: 0,
            sell_order_id: 0,
            price,
            quantity,
            taker,
        });
    }

    if trades.is_empty() {
        return;
    }
    if let Some(tx) = shared.trade_out.lock().await.as_ref() {
        let _ = tx.send(trades).await;
    }
}

async fn handle_book_payload(body: &Value, shared: &Arc<Shared>, exchange: &str, symbol: &str, ts_millis: Option<i64>) {
    let levels: Vec<&Value> = match body.as_array() {
        Some(arr) if arr.first().map(Value::is_array).unwrap_or(false) => arr.iter().collect(),
        Some(_) => vec![body],
        None => return,
    };

    let (mut bids, mut asks) = (Vec::new(), Vec::new());
    for level in levels {
        let entry = match level.as_array() {
            Some(e) if e.len() == 3 => e,
            _ => continue,
        };
        let price = match as_number(&entry[0]) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let count = entry[1].as_i64().unwrap_or(0);
        let amount = match as_number(&entry[2]) {
            Some(n) => n,
            None => continue,
        };
        let (side, quantity) = signed_amount_to_side_and_quantity(amount);
        if count == 0 {
            // Price level removed. Represented with a zero quantity so the
            // aggregator still emits a record for the deletion.
            let level = PriceLevel::new(price, "0".to_string());
            match side {
                Side::Bid => bids.push(level),
                Side::Ask => asks.push(level),
            }
            continue;
        }
        let level = PriceLevel::new(price, quantity);
        match side {
            Side::Bid => bids.push(level),
            Side::Ask => asks.push(level),
        }
    }

    if bids.is_empty() && asks.is_empty() {
        return;
    }

    let now = Timestamp::now();
    let update = BookUpdate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: ts_millis.map(Timestamp::from_millis).unwrap_or(now),
        received: now,
        bids,
        asks,
    };
    if let Some(tx) = shared.book_out.lock().await.as_ref() {
        let _ = tx.send(update).await;
    }
}

async fn handle_trade_event(
    tag: &str,
    array: &[Value],
    shared: &Arc<Shared>,
    exchange: &str,
    symbol: &str,
) {
    if tag == "tu" {
        // Confirmed duplicate of a preceding "te"; the "te" frame already published it.
        return;
    }
    if tag != "te" {
        return;
    }
    let body = match array.get(2).and_then(Value::as_array) {
        Some(b) => b,
        None => return,
    };
    if body.len() < 4 {
        logging::error_parse(exchange, symbol, "malformed trade execution frame");
        return;
    }
    let trade_id = body[0].as_u64().unwrap_or(0);
    let occurred_millis = body[1].as_i64().unwrap_or(0);
    let amount = match as_number(&body[2]) {
        Some(n) => n,
        None => {
            logging::error_parse(exchange, symbol, "malformed trade amount");
            return;
        }
    };
    let price = match as_number(&body[3]) {
        Some(n) => n.to_string(),
        None => {
            logging::error_parse(exchange, symbol, "malformed trade price");
            return;
        }
    };
    let (taker, quantity) = signed_amount_to_side_and_quantity(amount);

    let now = Timestamp::now();
    let trade = Trade {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: now,
        received: now,
        occurred: Timestamp::from_millis(occurred_millis),
        trade_id,
        buy_order_id: 0,
        sell_order_id: 0,
        price,
        quantity,
        taker,
    };
    if let Some(tx) = shared.trade_out.lock().await.as_ref() {
        let _ = tx.send(vec![trade]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribed_event_registers_the_channel() {
        let mut channels = HashMap::new();
        let value: Value = serde_json::from_str(
            r#"{"event":"subscribed","channel":"book","chanId":17,"symbol":"tBTCUSD"}"#,
        )
        .unwrap();
        handle_event(&value, &mut channels, "Bitfinex", "BTCUSD");
        assert_eq!(channels.get(&17), Some(&Feed::Book));
    }

    #[tokio::test]
    async fn book_snapshot_decodes_signed_amounts_and_the_trailing_timestamp() {
        let shared = Arc::new(Shared {
            write: Mutex::new(None),
            book_out: Mutex::new(None),
            trade_out: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::channel(4);
        *shared.book_out.lock().await = Some(tx);

        let mut channels = HashMap::new();
        channels.insert(17082, Feed::Book);

        let array: Vec<Value> =
            serde_json::from_str(r#"[17082, [[100.0, 3, 5.0], [101.0, 2, -4.0]], 1, 1710000000000]"#).unwrap();
        handle_payload(17082, &array, &channels, &shared, "Bitfinex", "BTCUSD").await;

        let update = rx.recv().await.unwrap();
        assert_eq!(update.bids.len(), 1);
        assert_eq!(update.bids[0].quantity, "5.0");
        assert_eq!(update.asks.len(), 1);
        assert_eq!(update.asks[0].quantity, "4.0");
        assert_eq!(update.timestamp.as_millis(), 1_710_000_000_000);
    }

    #[tokio::test]
    async fn sequence_gap_is_detected_but_does_not_stop_dispatch() {
        let shared = Arc::new(Shared {
            write: Mutex::new(None),
            book_out: Mutex::new(None),
            trade_out: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::channel(4);
        *shared.book_out.lock().await = Some(tx);

        let mut channels = HashMap::new();
        channels.insert(17082, Feed::Book);
        let mut next_seq = Some(2);

        let text = r#"[17082, [100.0, 0, 1.0], 4, 1710000000100]"#;
        handle_frame(text, &mut channels, &mut next_seq, &shared, "Bitfinex", "BTCUSD").await;

        assert_eq!(next_seq, Some(5));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.bids.len(), 1);
        assert_eq!(update.bids[0].quantity, "0");
    }

    #[tokio::test]
    async fn sequence_is_connection_wide_across_interleaved_channels() {
        let shared = Arc::new(Shared {
            write: Mutex::new(None),
            book_out: Mutex::new(None),
            trade_out: Mutex::new(None),
        });
        let (book_tx, mut book_rx) = mpsc::channel(4);
        let (trade_tx, mut trade_rx) = mpsc::channel(4);
        *shared.book_out.lock().await = Some(book_tx);
        *shared.trade_out.lock().await = Some(trade_tx);

        let mut channels = HashMap::new();
        channels.insert(1, Feed::Book);
        channels.insert(2, Feed::Trades);
        let mut next_seq = None;

        let frames = [
            r#"[1, [100.0, 1, 1.0], 1, 1710000000000]"#,
            r#"[2, [[1,1710000000100,-1.0,100.0]], 2, 1710000000100]"#,
            r#"[1, [100.0, 1, 1.0], 3, 1710000000200]"#,
        ];
        for frame in frames {
            handle_frame(frame, &mut channels, &mut next_seq, &shared, "Bitfinex", "BTCUSD").await;
        }

        // A single counter advances by one across both channels; if it were
        // tracked per channel each would see 1, 3 and falsely report a gap.
        assert_eq!(next_seq, Some(4));
        assert!(book_rx.recv().await.is_some());
        assert!(trade_rx.recv().await.is_some());
        assert!(book_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn trade_execution_frame_is_published_and_duplicate_tu_is_dropped() {
        let shared = Arc::new(Shared {
            write: Mutex::new(None),
            book_out: Mutex::new(None),
            trade_out: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::channel(4);
        *shared.trade_out.lock().await = Some(tx);

        let array: Vec<Value> = serde_json::from_str(r#"[18,"te",[123,1700000000,-2.5,50000.0]]"#).unwrap();
        handle_trade_event("te", &array, &shared, "Bitfinex", "BTCUSD").await;
        let trades = rx.recv().await.unwrap();
        let trade = &trades[0];
        assert_eq!(trade.taker, Side::Ask);
        assert_eq!(trade.quantity, "2.5");

        let array_tu: Vec<Value> = serde_json::from_str(r#"[18,"tu",[123,456,1700000000,-2.5,50000.0]]"#).unwrap();
        handle_trade_event("tu", &array_tu, &shared, "Bitfinex", "BTCUSD").await;
        assert!(rx.try_recv().is_err());
    }
}

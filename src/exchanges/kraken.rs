//! Kraken adapter: channel-name routed multiplexing (`book`/`trade`) over a
//! single public WebSocket connection.

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

use crate::listener::{ChannelSlot, DialError, Listener, FEED_CHANNEL_CAPACITY};
use crate::logging;
use crate::model::{BookUpdate, PriceLevel, Side, Trade};
use crate::time::Timestamp;

const WS_ENDPOINT: &str = "wss://ws.kraken.com";
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;
const BOOK_DEPTH: u32 = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Book,
    Trade,
}

struct Shared {
    write: Mutex<Option<SplitSink<WsStream, Message>>>,
    book_out: Mutex<Option<mpsc::Sender<BookUpdate>>>,
    trade_out: Mutex<Option<mpsc::Sender<Vec<Trade>>>>,
}

pub struct KrakenListener {
    symbol: String,
    shared: Arc<Shared>,
    book_slot: ChannelSlot<BookUpdate>,
    trade_slot: ChannelSlot<Vec<Trade>>,
}

impl KrakenListener {
    pub fn new(symbol: &str) -> Self {
        KrakenListener {
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

    /// Kraken pairs are conventionally slash-separated, e.g. `XBT/USD`.
    fn wire_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }
}

#[async_trait]
impl Listener for KrakenListener {
    fn exchange(&self) -> &str {
        "Kraken"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), DialError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(WS_ENDPOINT).await?;
        let (sink, stream) = ws_stream.split();

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
            "pair": [self.wire_symbol()],
            "subscription": { "name": "book", "depth": BOOK_DEPTH },
        });
        send_json(&self.shared, &subscribe).await;
        Some(rx)
    }

    async fn trades(&self) -> Option<mpsc::Receiver<Vec<Trade>>> {
        let (tx, rx) = self.trade_slot.subscribe_once(FEED_CHANNEL_CAPACITY).await?;
        *self.shared.trade_out.lock().await = Some(tx);

        let subscribe = json!({
            "event": "subscribe",
            "pair": [self.wire_symbol()],
            "subscription": { "name": "trade" },
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

fn spawn_tasks(
    mut stream: SplitStream<WsStream>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    exchange: String,
    symbol: String,
) {
    tokio::spawn(async move {
        let mut channels: HashMap<i64, Feed> = HashMap::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    logging::info_stopping(&exchange, &symbol);
                    shutdown(&shared).await;
                    break;
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            consecutive_errors = 0;
                            if !handle_frame(&text, &mut channels, &shared, &exchange, &symbol).await {
                                logging::info_stopping(&exchange, &symbol);
                                shutdown(&shared).await;
                                break;
                            }
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

async fn shutdown(shared: &Shared) {
    *shared.book_out.lock().await = None;
    *shared.trade_out.lock().await = None;
    if let Some(mut sink) = shared.write.lock().await.take() {
        let _ = sink.close().await;
    }
}

/// Returns `false` when the frame carried Kraken's one unrecoverable parse
/// error — an unrecognized trade side code — signaling the caller to tear
/// the connection down instead of continuing on a protocol assumption that
/// no longer holds.
async fn handle_frame(
    text: &str,
    channels: &mut HashMap<i64, Feed>,
    shared: &Arc<Shared>,
    exchange: &str,
    symbol: &str,
) -> bool {
    if text.contains("\"errorMessage\"") || text.contains("\"error\"") {
        logging::error_parse(exchange, symbol, &format!("server error: {text}"));
        return true;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            logging::error_parse(exchange, symbol, &format!("malformed frame: {e}"));
            return true;
        }
    };

    if let Some(object) = value.as_object() {
        handle_event(object, channels, exchange, symbol);
        return true;
    }

    let array = match value.as_array() {
        Some(a) if a.len() >= 4 => a,
        _ => return true,
    };
    let chan_id = match array[0].as_i64() {
        Some(id) => id,
        None => return true,
    };
    let feed = match channels.get(&chan_id) {
        Some(feed) => *feed,
        None => return true,
    };

    match feed {
        Feed::Book => {
            handle_book_payload(array, shared, exchange, symbol).await;
            true
        }
        Feed::Trade => handle_trade_payload(array, shared, exchange, symbol).await,
    }
}

fn handle_event(
    object: &serde_json::Map<String, Value>,
    channels: &mut HashMap<i64, Feed>,
    exchange: &str,
    symbol: &str,
) {
    let event = object.get("event").and_then(Value::as_str).unwrap_or("");
    match event {
        "subscriptionStatus" => {
            let status = object.get("status").and_then(Value::as_str).unwrap_or("");
            if status == "error" {
                let msg = object.get("errorMessage").and_then(Value::as_str).unwrap_or("subscription failed");
                logging::error_parse(exchange, symbol, msg);
                return;
            }
            let chan_id = object.get("channelID").and_then(Value::as_i64);
            let name = object
                .get("subscription")
                .and_then(|s| s.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if let Some(chan_id) = chan_id {
                let feed = match name {
                    "book" => Some(Feed::Book),
                    "trade" => Some(Feed::Trade),
                    _ => None,
                };
                if let Some(feed) = feed {
                    channels.insert(chan_id, feed);
                }
            }
        }
        "heartbeat" | "systemStatus" | "pong" => {}
        _ => {}
    }
}

async fn handle_book_payload(array: &[Value], shared: &Arc<Shared>, exchange: &str, symbol: &str) {
    let mut bids = Vec::new();
    let mut asks = Vec::new();

    // Payload objects sit between index 1 and the channel-name/pair trailer.
    for entry in &array[1..array.len() - 2] {
        let object = match entry.as_object() {
            Some(o) => o,
            None => continue,
        };
        if let Some(levels) = object.get("bs").or_else(|| object.get("b")).and_then(Value::as_array) {
            bids.extend(levels.iter().filter_map(parse_level));
        }
        if let Some(levels) = object.get("as").or_else(|| object.get("a")).and_then(Value::as_array) {
            asks.extend(levels.iter().filter_map(parse_level));
        }
    }

    if bids.is_empty() && asks.is_empty() {
        return;
    }

    let now = Timestamp::now();
    let update = BookUpdate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: now,
        received: now,
        bids,
        asks,
    };
    if let Some(tx) = shared.book_out.lock().await.as_ref() {
        let _ = tx.send(update).await;
    }
}

fn parse_level(entry: &Value) -> Option<PriceLevel> {
    let triple = entry.as_array()?;
    let price = triple.first()?.as_str()?;
    let quantity = triple.get(1)?.as_str()?;
    Some(PriceLevel::new(price.to_string(), quantity.to_string()))
}

async fn handle_trade_payload(array: &[Value], shared: &Arc<Shared>, exchange: &str, symbol: &str) -> bool {
    let entries = match array[1].as_array() {
        Some(e) => e,
        None => return true,
    };

    let mut trades = Vec::new();
    for entry in entries {
        let fields = match entry.as_array() {
            Some(f) if f.len() >= 4 => f,
            _ => {
                logging::error_parse(exchange, symbol, "malformed trade entry");
                continue;
            }
        };
        let price = match fields[0].as_str() {
            Some(p) => p.to_string(),
            None => continue,
        };
        let quantity = match fields[1].as_str() {
            Some(q) => q.to_string(),
            None => continue,
        };
        let occurred_secs: f64 = match fields[2].as_str().and_then(|s| s.parse().ok()) {
            Some(t) => t,
            None => continue,
        };
        let side_code = fields[3].as_str().unwrap_or("");
        let taker = match side_code {
            "b" => Side::Bid,
            "s" => Side::Ask,
            other => {
                logging::error_parse(
                    exchange,
                    symbol,
                    &format!("unrecoverable: unknown trade side code '{other}'"),
                );
                return false;
            }
        };

        let now = Timestamp::now();
        trades.push(Trade {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            timestamp: now,
            received: now,
            occurred: Timestamp::from_secs_f64(occurred_secs),
            trade_id: 0,
            buy_order_id: 0,
            sell_order_id: 0,
            price,
            quantity,
            taker,
        });
    }

    if !trades.is_empty() {
        if let Some(tx) = shared.trade_out.lock().await.as_ref() {
            let _ = tx.send(trades).await;
        }
    }
    true
}

//! Binance adapter: snapshot+stream book synchronization and a trade feed,
//! both multiplexed over a single combined-stream WebSocket connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_derive::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tungstenite::Message;

use crate::exchanges::util::EventEnvelope;
use crate::listener::{ChannelSlot, DialError, Listener, FEED_CHANNEL_CAPACITY};
use crate::logging;
use crate::model::{BookUpdate, PriceLevel, Side, Trade};
use crate::time::Timestamp;

const WS_ENDPOINT: &str = "wss://stream.binance.com:9443/ws";
const SNAPSHOT_ENDPOINT: &str = "https://api.binance.com/api/v3/depth";
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw input to the processor task: either a frame off the socket or the
/// result of the one-shot REST snapshot fetch. Carrying both on one channel
/// is what lets the processor splice the snapshot into the live stream
/// without a second, separately-scheduled state machine.
enum RawEvent {
    Frame(Message),
    Snapshot(Result<SnapshotWire, String>),
}

struct Shared {
    write: Mutex<Option<SplitSink<WsStream, Message>>>,
    raw_tx: Mutex<Option<mpsc::Sender<RawEvent>>>,
    book_out: Mutex<Option<mpsc::Sender<BookUpdate>>>,
    trade_out: Mutex<Option<mpsc::Sender<Vec<Trade>>>>,
}

pub struct BinanceListener {
    symbol: String,
    shared: Arc<Shared>,
    book_slot: ChannelSlot<BookUpdate>,
    trade_slot: ChannelSlot<Vec<Trade>>,
}

impl BinanceListener {
    pub fn new(symbol: &str) -> Self {
        BinanceListener {
            symbol: symbol.to_string(),
            shared: Arc::new(Shared {
                write: Mutex::new(None),
                raw_tx: Mutex::new(None),
                book_out: Mutex::new(None),
                trade_out: Mutex::new(None),
            }),
            book_slot: ChannelSlot::new(),
            trade_slot: ChannelSlot::new(),
        }
    }

    fn stream_symbol(&self) -> String {
        self.symbol.to_lowercase()
    }

    fn snapshot_symbol(&self) -> String {
        self.symbol.to_uppercase()
    }
}

#[async_trait]
impl Listener for BinanceListener {
    fn exchange(&self) -> &str {
        "Binance"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn start(&self, cancel: CancellationToken) -> Result<(), DialError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(WS_ENDPOINT).await?;
        let (sink, stream) = ws_stream.split();

        *self.shared.write.lock().await = Some(sink);

        let (raw_tx, raw_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        *self.shared.raw_tx.lock().await = Some(raw_tx.clone());

        logging::info_starting(self.exchange(), self.symbol());

        spawn_reader(stream, raw_tx, cancel.clone());
        spawn_processor(
            raw_rx,
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
            "method": "SUBSCRIBE",
            "params": [format!("{}@depth", self.stream_symbol())],
            "id": 1,
        });
        send_json(&self.shared, &subscribe).await;

        let shared = self.shared.clone();
        let symbol = self.snapshot_symbol();
        tokio::spawn(async move {
            let result = fetch_snapshot(&symbol).await;
            if let Some(raw_tx) = shared.raw_tx.lock().await.as_ref() {
                let _ = raw_tx.send(RawEvent::Snapshot(result)).await;
            }
        });

        Some(rx)
    }

    async fn trades(&self) -> Option<mpsc::Receiver<Vec<Trade>>> {
        let (tx, rx) = self.trade_slot.subscribe_once(FEED_CHANNEL_CAPACITY).await?;
        *self.shared.trade_out.lock().await = Some(tx);

        let subscribe = json!({
            "method": "SUBSCRIBE",
            "params": [format!("{}@trade", self.stream_symbol())],
            "id": 2,
        });
        send_json(&self.shared, &subscribe).await;

        Some(rx)
    }
}

async fn send_json(shared: &Shared, value: &serde_json::Value) {
    if let Some(sink) = shared.write.lock().await.as_mut() {
        let _ = sink.send(Message::Text(value.to_string())).await;
    }
}

fn spawn_reader(mut stream: SplitStream<WsStream>, raw_tx: mpsc::Sender<RawEvent>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut consecutive_errors: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            consecutive_errors = 0;
                            if raw_tx.send(RawEvent::Frame(Message::Text(text))).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
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

#[derive(Debug)]
enum BookSyncState {
    Buffering(Vec<DepthUpdateWire>),
    Started { last_final_id: u64 },
}

fn spawn_processor(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    exchange: String,
    symbol: String,
) {
    tokio::spawn(async move {
        let mut book_state = BookSyncState::Buffering(Vec::new());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    logging::info_stopping(&exchange, &symbol);
                    shutdown(&shared, &symbol).await;
                    break;
                }
                event = raw_rx.recv() => {
                    match event {
                        None => break,
                        Some(RawEvent::Frame(Message::Text(text))) => {
                            handle_frame(&text, &mut book_state, &shared, &exchange, &symbol).await;
                        }
                        Some(RawEvent::Frame(_)) => {}
                        Some(RawEvent::Snapshot(result)) => {
                            handle_snapshot(result, &mut book_state, &shared, &exchange, &symbol).await;
                        }
                    }
                }
            }
        }
    });
}

async fn handle_frame(
    text: &str,
    book_state: &mut BookSyncState,
    shared: &Arc<Shared>,
    exchange: &str,
    symbol: &str,
) {
    let envelope: EventEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(_) => return, // SUBSCRIBE acks and similar control frames have no "e" field.
    };

    match envelope.event.as_str() {
        "depthUpdate" => {
            let update: DepthUpdateWire = match serde_json::from_str(text) {
                Ok(u) => u,
                Err(e) => {
                    logging::error_parse(exchange, symbol, &format!("malformed depth update: {e}"));
                    return;
                }
            };
            match book_state {
                BookSyncState::Buffering(buffered) => buffered.push(update),
                BookSyncState::Started { last_final_id } => {
                    if update.final_update_id <= *last_final_id {
                        return;
                    }
                    if update.first_update_id != *last_final_id + 1 {
                        logging::warn_gap(
                            exchange,
                            symbol,
                            &format!(
                                "missing depth updates {}:{}",
                                *last_final_id + 1, update.first_update_id
                            ),
                        );
                    }
                    *last_final_id = update.final_update_id;
                    emit_book_update(shared, exchange, symbol, &update).await;
                }
            }
        }
        "trade" => {
            let trade: TradeWire = match serde_json::from_str(text) {
                Ok(t) => t,
                Err(e) => {
                    logging::error_parse(exchange, symbol, &format!("malformed trade: {e}"));
                    return;
                }
            };
            emit_trade(shared, exchange, symbol, &trade).await;
        }
        _ => {}
    }
}

async fn handle_snapshot(
    result: Result<SnapshotWire, String>,
    book_state: &mut BookSyncState,
    shared: &Arc<Shared>,
    exchange: &str,
    symbol: &str,
) {
    let snapshot = match result {
        Ok(s) => s,
        Err(e) => {
            logging::error_parse(exchange, symbol, &format!("depth snapshot fetch failed: {e}"));
            return;
        }
    };

    let buffered = match std::mem::replace(book_state, BookSyncState::Started { last_final_id: snapshot.last_update_id }) {
        BookSyncState::Buffering(buffered) => buffered,
        started @ BookSyncState::Started { .. } => {
            // book() was somehow called twice; keep the first splice.
            *book_state = started;
            return;
        }
    };

    let now = Timestamp::now();
    let snapshot_update = BookUpdate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: now,
        received: now,
        bids: snapshot
            .bids
            .into_iter()
            .map(|[p, q]| PriceLevel::new(p, q))
            .collect(),
        asks: snapshot
            .asks
            .into_iter()
            .map(|[p, q]| PriceLevel::new(p, q))
            .collect(),
    };
    send_book(shared, snapshot_update).await;

    let mut last_final_id = snapshot.last_update_id;
    for update in buffered {
        if update.final_update_id < last_final_id + 1 {
            continue;
        }
        if update.first_update_id != last_final_id + 1 {
            logging::warn_gap(
                exchange,
                symbol,
                &format!("missing depth updates {}:{}", last_final_id + 1, update.first_update_id),
            );
        }
        last_final_id = update.final_update_id;
        emit_book_update(shared, exchange, symbol, &update).await;
    }

    *book_state = BookSyncState::Started { last_final_id };
}

async fn emit_book_update(shared: &Arc<Shared>, exchange: &str, symbol: &str, update: &DepthUpdateWire) {
    let now = Timestamp::now();
    let book_update = BookUpdate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: Timestamp::from_millis(update.event_time),
        received: now,
        bids: update
            .bids
            .iter()
            .map(|[p, q]| PriceLevel::new(p.clone(), q.clone()))
            .collect(),
        asks: update
            .asks
            .iter()
            .map(|[p, q]| PriceLevel::new(p.clone(), q.clone()))
            .collect(),
    };
    send_book(shared, book_update).await;
}

async fn send_book(shared: &Arc<Shared>, update: BookUpdate) {
    if let Some(tx) = shared.book_out.lock().await.as_ref() {
        let _ = tx.send(update).await;
    }
}

async fn emit_trade(shared: &Arc<Shared>, exchange: &str, symbol: &str, trade: &TradeWire) {
    let taker = if trade.maker_is_buyer { Side::Ask } else { Side::Bid };
    let now = Timestamp::now();
    let normalized = Trade {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timestamp: Timestamp::from_millis(trade.event_time),
        received: now,
        occurred: Timestamp::from_millis(trade.trade_time),
        trade_id: trade.trade_id,
        buy_order_id: trade.buyer_order_id,
        sell_order_id: trade.seller_order_id,
        price: trade.price.clone(),
        quantity: trade.quantity.clone(),
        taker,
    };
    if let Some(tx) = shared.trade_out.lock().await.as_ref() {
        let _ = tx.send(vec![normalized]).await;
    }
}

/// Unsubscribes from whichever streams were actually opened, then closes
/// both output slots and the socket.
async fn shutdown(shared: &Shared, symbol: &str) {
    let stream_symbol = symbol.to_lowercase();
    let mut params = Vec::new();
    if shared.book_out.lock().await.is_some() {
        params.push(format!("{stream_symbol}@depth"));
    }
    if shared.trade_out.lock().await.is_some() {
        params.push(format!("{stream_symbol}@trade"));
    }
    if !params.is_empty() {
        let unsubscribe = json!({
            "method": "UNSUBSCRIBE",
            "params": params,
            "id": 3,
        });
        send_json(shared, &unsubscribe).await;
    }
    *shared.book_out.lock().await = None;
    *shared.trade_out.lock().await = None;
    if let Some(mut sink) = shared.write.lock().await.take() {
        let _ = sink.close().await;
    }
}

async fn fetch_snapshot(symbol: &str) -> Result<SnapshotWire, String> {
    let url = format!("{SNAPSHOT_ENDPOINT}?symbol={symbol}&limit=1000");
    let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    response.json::<SnapshotWire>().await.map_err(|e| e.to_string())
}

#[derive(Deserialize, Debug, Clone)]
struct SnapshotWire {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Deserialize, Debug, Clone)]
struct DepthUpdateWire {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Deserialize, Debug, Clone)]
struct TradeWire {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "b")]
    buyer_order_id: u64,
    #[serde(rename = "a")]
    seller_order_id: u64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    maker_is_buyer: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_update(first: u64, last: u64) -> DepthUpdateWire {
        DepthUpdateWire {
            event_time: 0,
            first_update_id: first,
            final_update_id: last,
            bids: vec![],
            asks: vec![],
        }
    }

    #[tokio::test]
    async fn snapshot_splice_discards_stale_buffered_updates_and_replays_the_rest() {
        let shared = Arc::new(Shared {
            write: Mutex::new(None),
            raw_tx: Mutex::new(None),
            book_out: Mutex::new(None),
            trade_out: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::channel(16);
        *shared.book_out.lock().await = Some(tx);

        let mut book_state = BookSyncState::Buffering(vec![
            depth_update(995, 999),
            depth_update(1001, 1005),
            depth_update(1006, 1010),
        ]);

        handle_snapshot(
            Ok(SnapshotWire {
                last_update_id: 1000,
                bids: vec![["100.0".to_string(), "1.0".to_string()]],
                asks: vec![],
            }),
            &mut book_state,
            &shared,
            "Binance",
            "BTCUSDT",
        )
        .await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.bids.len(), 1);

        let first_replayed = rx.recv().await.unwrap();
        assert!(first_replayed.bids.is_empty() && first_replayed.asks.is_empty());

        let second_replayed = rx.recv().await.unwrap();
        assert!(second_replayed.bids.is_empty() && second_replayed.asks.is_empty());

        assert!(matches!(book_state, BookSyncState::Started { last_final_id: 1010 }));
    }

    #[tokio::test]
    async fn gap_in_live_updates_emits_a_warning_but_still_publishes() {
        let shared = Arc::new(Shared {
            write: Mutex::new(None),
            raw_tx: Mutex::new(None),
            book_out: Mutex::new(None),
            trade_out: Mutex::new(None),
        });
        let (tx, mut rx) = mpsc::channel(16);
        *shared.book_out.lock().await = Some(tx);

        let mut book_state = BookSyncState::Started { last_final_id: 1010 };
        let update = depth_update(1012, 1015);
        emit_book_update(&shared, "Binance", "BTCUSDT", &update).await;
        if let BookSyncState::Started { last_final_id } = &mut book_state {
            *last_final_id = 1015;
        }

        let emitted = rx.recv().await.unwrap();
        assert_eq!(emitted.exchange, "Binance");
    }
}

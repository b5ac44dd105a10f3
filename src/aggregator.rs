//! Fan-in of every listener's book/trade channels into one normalized,
//! line-oriented stream on stdout, serialized behind a single writer so
//! lines from different listeners never interleave mid-record.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::model::{BookUpdate, Trade};

/// Prefixes every output record with `<id>,` when an experiment tag was
/// supplied on the command line.
pub struct LineWriter {
    tag: Option<u64>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl LineWriter {
    pub fn new(tag: Option<u64>) -> Self {
        LineWriter {
            tag,
            out: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    #[cfg(test)]
    fn for_buffer(tag: Option<u64>, buffer: Arc<std::sync::Mutex<Vec<u8>>>) -> Self {
        LineWriter {
            tag,
            out: Mutex::new(Box::new(BufferSink(buffer))),
        }
    }

    /// Writes one record. `kind` is `'B'` or `'T'`; `fields` is the
    /// comma-joined body that follows it. The experiment tag, when set, is
    /// inserted as `<N>,` right after the kind letter.
    async fn write_record(&self, kind: char, fields: &str) {
        let mut out = self.out.lock().await;
        let line = match self.tag {
            Some(id) => format!("{kind} {id},{fields}\n"),
            None => format!("{kind} {fields}\n"),
        };
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

#[cfg(test)]
struct BufferSink(Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn format_book_fields(update: &BookUpdate) -> Vec<String> {
    let symbol = update.symbol.to_uppercase();
    let mut fields = Vec::with_capacity(update.bids.len() + update.asks.len());
    for level in &update.bids {
        fields.push(format!(
            "{},{},{},{},BID,{},{}",
            update.timestamp,
            update.timestamp.format(),
            update.exchange,
            symbol,
            level.price,
            level.quantity,
        ));
    }
    for level in &update.asks {
        fields.push(format!(
            "{},{},{},{},ASK,{},{}",
            update.timestamp,
            update.timestamp.format(),
            update.exchange,
            symbol,
            level.price,
            level.quantity,
        ));
    }
    fields
}

fn format_trade_fields(trade: &Trade) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        trade.timestamp,
        trade.timestamp.format(),
        trade.exchange,
        trade.symbol.to_uppercase(),
        trade.trade_id,
        trade.buy_order_id,
        trade.sell_order_id,
        trade.taker.as_trade_str(),
        trade.price,
        trade.quantity,
    )
}

/// Drains every book receiver concurrently, shrinking the active set as
/// listeners close their channels, and writes one line per price level.
pub async fn run_book_aggregator(mut receivers: Vec<mpsc::Receiver<BookUpdate>>, writer: Arc<LineWriter>) {
    while !receivers.is_empty() {
        let (update, index, remaining) =
            futures::future::select_all(receivers.iter_mut().map(|rx| Box::pin(rx.recv()))).await;
        drop(remaining);
        match update {
            Some(update) => {
                for fields in format_book_fields(&update) {
                    writer.write_record('B', &fields).await;
                }
            }
            None => {
                receivers.remove(index);
            }
        }
    }
}

/// Drains every trade receiver concurrently, shrinking the active set as
/// listeners close their channels, and writes one line per trade.
pub async fn run_trade_aggregator(mut receivers: Vec<mpsc::Receiver<Vec<Trade>>>, writer: Arc<LineWriter>) {
    while !receivers.is_empty() {
        let (batch, index, remaining) =
            futures::future::select_all(receivers.iter_mut().map(|rx| Box::pin(rx.recv()))).await;
        drop(remaining);
        match batch {
            Some(trades) => {
                for trade in &trades {
                    writer.write_record('T', &format_trade_fields(trade)).await;
                }
            }
            None => {
                receivers.remove(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PriceLevel, Side};
    use crate::time::Timestamp;

    fn sample_book_update() -> BookUpdate {
        BookUpdate {
            exchange: "Binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timestamp: Timestamp::from_millis(1_710_000_000_000),
            received: Timestamp::from_millis(1_710_000_000_005),
            bids: vec![PriceLevel::new("100.0", "1.5")],
            asks: vec![PriceLevel::new("101.0", "2.5")],
        }
    }

    fn sample_trade() -> Trade {
        Trade {
            exchange: "Bitfinex".to_string(),
            symbol: "BTCUSD".to_string(),
            timestamp: Timestamp::from_millis(1_710_000_000_000),
            received: Timestamp::from_millis(1_710_000_000_005),
            occurred: Timestamp::from_millis(1_710_000_000_000),
            trade_id: 42,
            buy_order_id: 0,
            sell_order_id: 0,
            price: "100.5".to_string(),
            quantity: "0.3".to_string(),
            taker: Side::Ask,
        }
    }

    #[test]
    fn book_line_format_matches_the_wire_contract() {
        let fields = format_book_fields(&sample_book_update());
        assert_eq!(fields.len(), 2);
        assert!(fields[0].starts_with("1710000000000,"));
        assert!(fields[0].contains(",Binance,BTCUSDT,BID,100.0,1.5"));
        assert!(fields[1].contains(",Binance,BTCUSDT,ASK,101.0,2.5"));
    }

    #[test]
    fn trade_line_format_matches_the_wire_contract() {
        let fields = format_trade_fields(&sample_trade());
        assert!(fields.starts_with("1710000000000,"));
        assert!(fields.contains(",Bitfinex,BTCUSD,42,0,0,SELL,100.5,0.3"));
    }

    #[tokio::test]
    async fn book_aggregator_drains_until_every_channel_closes() {
        let (tx1, rx1) = mpsc::channel(4);
        let (tx2, rx2) = mpsc::channel(4);
        let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer = Arc::new(LineWriter::for_buffer(None, buffer.clone()));

        tx1.send(sample_book_update()).await.unwrap();
        drop(tx1);
        drop(tx2);

        run_book_aggregator(vec![rx1, rx2], writer).await;

        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(output.lines().count(), 2);
    }

    #[tokio::test]
    async fn experiment_tag_prefixes_every_line() {
        let (tx, rx) = mpsc::channel(4);
        let buffer = Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer = Arc::new(LineWriter::for_buffer(Some(7), buffer.clone()));

        tx.send(vec![sample_trade()]).await.unwrap();
        drop(tx);

        run_trade_aggregator(vec![rx], writer).await;

        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(output.starts_with("T 7,1710000000000,"));
    }
}

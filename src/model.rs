//! Normalized event model shared by every venue adapter.
//!
//! Price and quantity are always carried as their wire string form; the core
//! never parses them to float, so downstream accounting sees the exact
//! decimal the venue sent.

use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Label used on book output lines.
    pub fn as_book_str(&self) -> &'static str {
        match self {
            Side::Bid => "BID",
            Side::Ask => "ASK",
        }
    }

    /// Label used on trade output lines, where Bid/Ask alias Buy/Sell.
    pub fn as_trade_str(&self) -> &'static str {
        match self {
            Side::Bid => "BUY",
            Side::Ask => "SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: String,
    pub quantity: String,
}

impl PriceLevel {
    pub fn new(price: impl Into<String>, quantity: impl Into<String>) -> Self {
        PriceLevel {
            price: price.into(),
            quantity: quantity.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub exchange: String,
    pub symbol: String,
    pub timestamp: Timestamp,
    pub received: Timestamp,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub exchange: String,
    pub symbol: String,
    pub timestamp: Timestamp,
    pub received: Timestamp,
    pub occurred: Timestamp,
    pub trade_id: u64,
    pub buy_order_id: u64,
    pub sell_order_id: u64,
    pub price: String,
    pub quantity: String,
    pub taker: Side,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_side_labels() {
        assert_eq!(Side::Bid.as_book_str(), "BID");
        assert_eq!(Side::Ask.as_book_str(), "ASK");
    }

    #[test]
    fn trade_side_labels_alias_buy_sell() {
        assert_eq!(Side::Bid.as_trade_str(), "BUY");
        assert_eq!(Side::Ask.as_trade_str(), "SELL");
    }
}

//! Small helpers shared by more than one venue adapter. Kept deliberately
//! thin — most wire-format quirks live in the adapter that owns them.

use serde_derive::Deserialize;

/// Peeks at a Binance/Kraken-style event envelope's discriminant field
/// without committing to the full payload shape.
#[derive(Deserialize, Debug)]
pub struct EventEnvelope {
    #[serde(rename = "e")]
    pub event: String,
}

/// Splits a Bitfinex signed-amount JSON number into a book side and its
/// absolute-value decimal text, without ever routing the value through an
/// f64 parse/format round trip. Relies on `serde_json`'s
/// `arbitrary_precision` feature, under which `Number::to_string()` returns
/// the exact source text rather than a re-serialized float.
pub fn signed_amount_to_side_and_quantity(amount: &serde_json::Number) -> (crate::model::Side, String) {
    let text = amount.to_string();
    match text.strip_prefix('-') {
        Some(magnitude) => (crate::model::Side::Ask, magnitude.to_string()),
        None => (crate::model::Side::Bid, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_amount_is_ask_with_stripped_sign() {
        let n = serde_json::Number::from_f64(-4.0).unwrap();
        let (side, qty) = signed_amount_to_side_and_quantity(&n);
        assert_eq!(side, crate::model::Side::Ask);
        assert_eq!(qty, "4.0");
    }

    #[test]
    fn positive_amount_is_bid() {
        let n = serde_json::Number::from_f64(5.0).unwrap();
        let (side, qty) = signed_amount_to_side_and_quantity(&n);
        assert_eq!(side, crate::model::Side::Bid);
        assert_eq!(qty, "5.0");
    }
}

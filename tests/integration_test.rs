use venue_collector::cli::expand_targets;
use venue_collector::exchanges::Exchange;

#[test]
fn bare_symbol_target_fans_out_to_every_recognized_venue() {
    let targets = expand_targets(&["ethusd".to_string()]).expect("expansion should succeed");
    let exchanges: Vec<Exchange> = targets.iter().map(|t| t.exchange).collect();
    assert!(exchanges.contains(&Exchange::Binance));
    assert!(exchanges.contains(&Exchange::Bitfinex));
    assert!(exchanges.contains(&Exchange::Kraken));
    assert_eq!(targets.len(), Exchange::ALL.len());
}

#[test]
fn qualified_targets_mix_with_bare_targets_in_one_invocation() {
    let targets = expand_targets(&[
        "binance:btcusdt".to_string(),
        "ethusd".to_string(),
    ])
    .expect("expansion should succeed");

    // One qualified target plus one bare target expanded across every venue.
    assert_eq!(targets.len(), 1 + Exchange::ALL.len());
}

#[test]
fn reserved_but_unimplemented_exchange_surfaces_a_configuration_error_not_a_panic() {
    let err = expand_targets(&["huobi:btcusdt".to_string()]).unwrap_err();
    assert!(err.to_string().contains("not yet implemented"));
}

//! Starts every configured listener, wires their feeds into the aggregators,
//! and owns the process-wide cancellation that a SIGINT or a failed startup
//! triggers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::aggregator::{self, LineWriter};
use crate::cli::Target;
use crate::listener::{DialError, Listener};
use crate::logging;

/// Builds, starts, and drains listeners for every target. Startup is
/// sequential: the first listener that fails to dial cancels the others and
/// the whole run returns that error. SIGINT is only honored once startup has
/// completed, so a signal during the dial sequence doesn't race a half-wired
/// fan-in.
pub async fn run(targets: Vec<Target>, emit_books: bool, emit_trades: bool, experiment_tag: Option<u64>) -> Result<(), DialError> {
    let cancel = CancellationToken::new();
    let mut listeners: Vec<Box<dyn Listener>> = Vec::with_capacity(targets.len());

    for target in &targets {
        let listener = target.exchange.build_listener(&target.symbol);
        if let Err(err) = listener.start(cancel.clone()).await {
            logging::error_parse(listener.exchange(), listener.symbol(), &err.to_string());
            cancel.cancel();
            return Err(err);
        }
        listeners.push(listener);
    }

    let mut book_receivers = Vec::new();
    let mut trade_receivers = Vec::new();
    for listener in &listeners {
        if emit_books {
            if let Some(rx) = listener.book().await {
                book_receivers.push(rx);
            }
        }
        if emit_trades {
            if let Some(rx) = listener.trades().await {
                trade_receivers.push(rx);
            }
        }
    }

    let writer = Arc::new(LineWriter::new(experiment_tag));

    let sigint_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        sigint_cancel.cancel();
    });

    let (book_writer, trade_writer) = (writer.clone(), writer);
    let book_task = tokio::spawn(aggregator::run_book_aggregator(book_receivers, book_writer));
    let trade_task = tokio::spawn(aggregator::run_trade_aggregator(trade_receivers, trade_writer));

    let _ = tokio::join!(book_task, trade_task);

    // Listeners are kept alive until both aggregators have drained every feed.
    drop(listeners);

    Ok(())
}

//! Process-wide destination for errors that have no other way to surface.
//!
//! Listener panics, failures of work dispatched to a pool after its target
//! cell already completed, and ownership violations during forwarding all end
//! up here. Every report is also emitted as a `tracing` error event.

use crate::error::Error;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::error;

/// Handler installed with [`set_exception_sink`].
pub type SinkFn = dyn Fn(&Error) + Send + Sync + 'static;

struct Sink(Box<SinkFn>);

static SINK: ArcSwapOption<Sink> = ArcSwapOption::const_empty();

/// Routes subsequent reports to `sink`, replacing the previous handler.
pub fn set_exception_sink(sink: impl Fn(&Error) + Send + Sync + 'static) {
    SINK.store(Some(Arc::new(Sink(Box::new(sink)))));
}

/// Restores the default handler, which prints to standard error.
pub fn reset_exception_sink() {
    SINK.store(None);
}

/// Hands `error` to the installed handler.
pub fn report_exception(error: &Error) {
    error!(%error, "unhandled error");
    match SINK.load_full() {
        Some(sink) => (sink.0)(error),
        None => eprintln!("unhandled error: {error}"),
    }
}

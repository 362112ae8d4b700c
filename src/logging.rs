//! Logging plumbing. Sockets accept an optional `slog` logger and fall back
//! to a discarding root, so the library stays silent unless the embedding
//! application wires it up.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal logger writing to stderr at debug level, for demo
/// programs and tests.
pub fn terminal() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);

    builder.build().expect("terminal logger construction failed")
}

//! Shared tracing initialization.
//!
//! Both the hub binary and any test harness that wants readable output call
//! [`init_tracing`]: a compact fmt layer plus an `EnvFilter`, centralized
//! here so the binary crate stays thin.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize a global tracing subscriber.
///
/// `verbose` raises the default level to `debug` when `RUST_LOG` is unset;
/// an explicit `RUST_LOG` always wins.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer().with_target(false).compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

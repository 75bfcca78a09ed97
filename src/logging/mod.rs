//! Console logging for services built on the concurrency primitives.
//!
//! The primitives themselves only emit `tracing` events: lifecycle changes and
//! flushes at `debug`, dropped or discarded work at `warn`. Applications call
//! [`setup_tracing`] once at startup to get these printed.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RUST_LOG` | Log filter (e.g. `info`, `sansho=debug`) | `info` |
//!
//! Without the `pretty_logs` feature, output is plain text for log
//! aggregation:
//! ```text
//! DEBUG sansho::concurrency::autoflush: Flushed buffer items=64 elapsed_us=812 success=true
//! ```
//!
//! With `pretty_logs`, output is colorized with timestamps and span nesting:
//! ```text
//! 14:32:01.234 DEBUG | sansho::concurrency::autoflush: Flushed buffer items=64 ...
//! ```

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[cfg(feature = "pretty_logs")]
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(not(feature = "pretty_logs"))]
mod production;

#[cfg(feature = "pretty_logs")]
mod pretty;

const DEFAULT_FILTER: &str = "info";

/// Installs the console subscriber.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed. Use
/// [`try_setup_tracing`] where that may happen, e.g. in tests.
pub fn setup_tracing() {
    Registry::default().with(console_layer()).init();
    tracing::info!("Tracing initialized successfully [reporting to console]");
}

/// Installs the console subscriber unless one is installed already.
pub fn try_setup_tracing() -> anyhow::Result<()> {
    Registry::default()
        .with(console_layer())
        .try_init()
        .context("Failed to install the tracing subscriber")?;
    tracing::info!("Tracing initialized successfully [reporting to console]");

    Ok(())
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(feature = "pretty_logs")]
fn console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW)
        .event_format(pretty::PrettyLogFormat)
        .with_filter(filter())
        .boxed()
}

#[cfg(not(feature = "pretty_logs"))]
fn console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .event_format(production::ProductionLogFormat)
        .with_filter(filter())
        .boxed()
}

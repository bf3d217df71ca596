//! Tracing subscriber setup for the gateway binary.
//!
//! Structured logs carry job ids, fingerprints, and model slugs on the hot
//! paths; this installs the fmt subscriber the binary uses. Library code
//! only emits events and never installs a subscriber.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_level(true)
                .with_filter(LevelFilter::INFO),
        )
        .init();
}

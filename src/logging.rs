// Logging setup for the binaries
//
// The library only emits tracing events; installing a subscriber is left to
// whoever embeds it.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber. RUST_LOG wins over `filter` when set.
/// Calling it twice is harmless.
pub fn init(filter: &str) {
    // try_init only fails when a global subscriber is already set; the first one stays
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_twice_is_harmless() {
        super::init("debug");
        super::init("info");
        tracing::info!("logging initialised");
    }
}

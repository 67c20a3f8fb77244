//! Tracing setup for binaries, benches and tests
//!
//! The library only emits events; whoever embeds it decides where they go.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `luma_nvm=info`).
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "luma_nvm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

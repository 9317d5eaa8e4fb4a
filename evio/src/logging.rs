// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Opt-in tracing bootstrap for binaries and tests.
//!
//! The runtime itself only emits [`tracing`] events and never installs a
//! subscriber; embedding applications configure their own. This helper exists
//! for executables and tests that want sensible output without wiring layers
//! by hand.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes a formatting subscriber filtered by `RUST_LOG` (default
/// `warn`, `evio=info`).
///
/// Returns `false` if a global subscriber was already installed, which is
/// not an error: in test binaries whichever test gets there first wins.
pub fn try_init() -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,evio=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

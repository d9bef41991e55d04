//! Ambient logging setup.
//!
//! As a library this crate never forces a particular log output on its
//! embedder; it only makes sure `env_logger` is initialized at most once
//! so the `log` calls sprinkled through `prefetch`/`archive`/`decoder`
//! go somewhere when nobody else has wired up a `log` backend yet.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes `env_logger` from `RUST_LOG` if no logger is installed yet.
/// Safe to call from every entry point (`Registry::new`, the `python`
/// module's `#[pymodule]` init) — later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

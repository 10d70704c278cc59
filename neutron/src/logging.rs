//! Logging for the plugin.
//!
//! CNI plugins own stdout (it carries the result JSON), so all diagnostics go
//! to a single append-only JSON-lines file instead.

use std::fs::OpenOptions;
use std::sync::Arc;

/// Fixed at build time; the CNI runtime gives us no place to configure it.
pub const LOG_FILE: &str = "/var/log/neutron.log";

/// Install the global subscriber. A plugin that cannot open its log file can
/// still do useful work, so failures here are swallowed.
pub fn init() {
    let file = match OpenOptions::new().create(true).append(true).open(LOG_FILE) {
        Ok(file) => file,
        Err(_) => return,
    };

    let _ = tracing_subscriber::fmt()
        .json()
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

//! Process-wide tracing setup shared by the conductor binaries and tests.

/// Initialize process-wide tracing with the default `info` level.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Initialize tracing with a caller-chosen fallback directive (used when
/// `RUST_LOG` is unset).
pub fn init_with_default(directive: &str) {
    tracing::init(directive);
}

/// Subscriber configuration (filters, formatter).
pub mod tracing;

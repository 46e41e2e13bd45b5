use tracing_subscriber::{EnvFilter, fmt};

pub use tracing::{debug, error, info, warn};

const DEFAULT_FILTER: &str = "zmigrate=info";

/// Install the global subscriber. Honors `RUST_LOG`; safe to call twice.
pub fn init_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::logger::info!($($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::logger::warn!($($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::logger::error!($($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::logger::debug!($($arg)*) };
}

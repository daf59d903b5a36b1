use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Default filter when neither `RUST_LOG` nor an explicit value is provided
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Initialize the tracing subscriber once for the whole process.
///
/// The filter is taken from `RUST_LOG` when it is set, otherwise from `default_value`,
/// otherwise `info`. Logs go to stderr so that command output on stdout stays clean.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        if std::env::var("RUST_BACKTRACE").is_err() {
            unsafe {
                std::env::set_var("RUST_BACKTRACE", "1");
            }
        }

        let filter = std::env::var("RUST_LOG")
            .ok()
            .or_else(|| default_value.map(ToOwned::to_owned))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned());

        tracing_setup(&filter);
    });
}

fn tracing_setup(filter: &str) {
    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .compact();

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // a subscriber may already be installed by a test harness
    drop(
        tracing_subscriber::registry()
            .with(filter)
            .with(format)
            .try_init(),
    );
}

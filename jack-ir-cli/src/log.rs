use tracing::Level;
use tracing_subscriber::{filter::Targets, fmt, prelude::*};

#[allow(unused_imports)]
pub use tracing::{debug, error, info, trace, warn};

/// Logs compact lines to stderr, stdout is left to the progress display.
pub fn init(level: Level) {
    let stderr_log = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(
            stderr_log.with_filter(
                Targets::default()
                    .with_target("jack_ir", level)
                    .with_target("jack_ir_core", level)
                    .with_default(Level::WARN),
            ),
        )
        .init();
}

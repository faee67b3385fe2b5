//! Logging setup with tracing.

use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `debug_level` picks the verbosity
/// of this crate (0 = info, 1 = debug, 2+ = trace). Safe to call twice; the
/// second call is ignored.
pub fn init(debug_level: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(..) => {
            let directives = match debug_level {
                0 => "warn,umleitung=info",
                1 => "warn,umleitung=debug",
                _ => "warn,umleitung=trace",
            };
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .parse_lossy(directives)
        }
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_target(debug_level >= 1)
        .with_thread_ids(debug_level >= 2)
        .with_file(debug_level >= 3)
        .with_line_number(debug_level >= 3)
        .with_ansi(std::io::stdout().is_terminal());

    let _ = builder.try_init();
}

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger. Components derive their own child
/// loggers from this root.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger config");

    config.build_logger().expect("Error building logger")
}

/// Logger that drops every record. Used when no parent logger is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

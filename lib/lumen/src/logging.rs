pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds a logger from a TOML logging configuration.
pub fn from_toml(config: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(config).map_err(|e| e.to_string())?;
    config.build_logger().map_err(|e| e.to_string())
}

/// Builds the default terminal logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging configuration must be valid")
}

/// Logger that discards everything. Used where no parent logger is supplied.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let _ = init();
    }

    #[test]
    fn test_bad_config_is_rejected() {
        assert!(from_toml("type = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn test_discard_logs_nothing() {
        let log = discard();
        debug!(log, "into the void"; "key" => 1);
    }
}

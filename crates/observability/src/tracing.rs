//! Tracing subscriber initialization.
//!
//! - `RUST_LOG` sets the filter (default `info`)
//! - `LOG_FORMAT` picks the output: `json` (default) or `pretty`

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Initialize from the environment.
pub fn init() {
    let format = match std::env::var("LOG_FORMAT") {
        Ok(raw) => raw.parse().unwrap_or_else(|err| {
            eprintln!("{err}; falling back to json");
            LogFormat::Json
        }),
        Err(_) => LogFormat::Json,
    };
    init_with(DEFAULT_DIRECTIVE, format);
}

/// Initialize with an explicit default directive and format.
///
/// `RUST_LOG` still wins over `default_directive` when set.
pub fn init_with(default_directive: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_formats() {
        assert_eq!("json".parse(), Ok(LogFormat::Json));
        assert_eq!(" Pretty ".parse(), Ok(LogFormat::Pretty));
        assert_eq!("text".parse(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_with("debug", LogFormat::Pretty);
        init_with("info", LogFormat::Json);
        ::tracing::info!("still logging");
    }
}

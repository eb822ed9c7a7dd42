//! Process-global tracing setup for mailroom binaries.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "mailroom=info";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Filter directive such as `info` or `mailroom=debug,sqlx=warn`. Falls
    /// back to `RUST_LOG`, then to `mailroom=info`.
    pub level: Option<String>,
    pub format: LogFormat,
}

/// Build the filter for the given options.
///
/// A bare level like `debug` is scoped to mailroom crates so dependencies stay quiet.
pub fn env_filter(options: &ObservabilityOptions) -> EnvFilter {
    let directive = match options.level.as_deref().map(str::trim) {
        Some(level) if !level.is_empty() && !level.contains('=') => {
            format!("mailroom={level},mailroom_backend_postgres={level}")
        }
        Some(level) if !level.is_empty() => level.to_string(),
        _ => return EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directive:?}: {err}; using {DEFAULT_FILTER}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Install the global subscriber. Calling this twice keeps the first subscriber.
pub fn init(options: ObservabilityOptions) {
    let filter = env_filter(&options);
    let result = match options.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(""), Some(LogFormat::Text));
        assert_eq!(LogFormat::parse("yaml"), None);
    }

    #[test]
    fn bare_level_is_scoped() {
        let filter = env_filter(&ObservabilityOptions {
            level: Some("debug".to_string()),
            format: LogFormat::Text,
        });
        assert!(filter.to_string().contains("mailroom=debug"));
    }
}

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::decode::WireFormat;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "console-stream.logs.jsonl";

// Stream output owns stdout, so stderr diagnostics stay quiet unless asked.
const CONSOLE_DEFAULT_FILTER: &str = "warn";
const JSON_DEFAULT_FILTER: &str = "warn,console_stream=info";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Where diagnostics go and how much of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    /// `EnvFilter` directives. `None` uses the sink's default.
    pub filter: Option<String>,
    /// JSON lines file. `None` writes compact lines to stderr.
    pub json_log_path: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: None,
            json_log_path: None,
        }
    }
}

impl ObservabilityConfig {
    /// Reads the configuration from the process environment.
    ///
    /// - `CONSOLE_OBSERVABILITY_ENABLED`: optional enable/disable flag (default enabled).
    /// - `CONSOLE_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
    /// - `RUST_LOG`: used when `CONSOLE_LOG_LEVEL` is unset.
    /// - `CONSOLE_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that
    ///   file with session and watch span fields on every line.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("CONSOLE_OBSERVABILITY_ENABLED")
            .and_then(|v| parse_bool_env(&v))
            .unwrap_or(true);
        let filter = ["CONSOLE_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty());
        let json_log_path = lookup("CONSOLE_JSON_LOG_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self {
            enabled,
            filter,
            json_log_path,
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let default = if self.json_log_path.is_some() {
            JSON_DEFAULT_FILTER
        } else {
            CONSOLE_DEFAULT_FILTER
        };
        self.filter
            .as_deref()
            .and_then(|f| tracing_subscriber::EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(default))
    }

    /// Directory and file name of the JSON log.
    fn json_log_location(&self) -> Option<(PathBuf, String)> {
        let path = self.json_log_path.as_ref()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_JSON_LOG_FILE)
            .to_string();
        Some((dir, file_name))
    }
}

/// Initialize diagnostics logging once per process from the environment.
///
/// See [`ObservabilityConfig::from_env`] for the variables read.
pub fn init_observability() {
    init_observability_with(ObservabilityConfig::from_env());
}

/// Initialize diagnostics logging once per process. Later calls are no-ops.
pub fn init_observability_with(config: ObservabilityConfig) {
    INIT.get_or_init(|| {
        if !config.enabled {
            return;
        }

        if let Some((dir, file_name)) = config.json_log_location() {
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(config.env_filter())
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(config.env_filter())
                .with(console_layer)
                .try_init();
        }
    });
}

/// Span wrapping a session's driver task.
pub(crate) fn session_span(id: &uuid::Uuid, format: WireFormat, url: &str) -> tracing::Span {
    let stream = match format {
        WireFormat::JsonLines => "logs",
        WireFormat::ServerSentEvents => "tokens",
    };
    tracing::info_span!("stream_session", session = %id, stream, url)
}

/// Span wrapping a subscribed status watch.
pub(crate) fn watch_span(resource: &str) -> tracing::Span {
    tracing::info_span!("status_watch", resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn bool_flags() {
        assert_eq!(parse_bool_env(" Yes "), Some(true));
        assert_eq!(parse_bool_env("off"), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn defaults_to_enabled_console_output() {
        assert_eq!(ObservabilityConfig::from_lookup(lookup(&[])), ObservabilityConfig::default());
    }

    #[test]
    fn console_level_wins_over_rust_log() {
        let config = ObservabilityConfig::from_lookup(lookup(&[
            ("CONSOLE_LOG_LEVEL", "debug"),
            ("RUST_LOG", "trace"),
            ("CONSOLE_OBSERVABILITY_ENABLED", "off"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("debug"));
        assert!(!config.enabled);

        let config = ObservabilityConfig::from_lookup(lookup(&[
            ("CONSOLE_LOG_LEVEL", "  "),
            ("RUST_LOG", "console_stream=trace"),
            ("CONSOLE_OBSERVABILITY_ENABLED", "garbage"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("console_stream=trace"));
        assert!(config.enabled);
    }

    #[test]
    fn json_path_splits_into_dir_and_file() {
        let config =
            ObservabilityConfig::from_lookup(lookup(&[("CONSOLE_JSON_LOG_PATH", "logs/run.jsonl")]));
        assert_eq!(
            config.json_log_location(),
            Some((PathBuf::from("logs"), "run.jsonl".to_string()))
        );
        let bare = ObservabilityConfig::from_lookup(lookup(&[("CONSOLE_JSON_LOG_PATH", "run.jsonl")]));
        assert_eq!(
            bare.json_log_location(),
            Some((PathBuf::from("."), "run.jsonl".to_string()))
        );
        assert_eq!(ObservabilityConfig::default().json_log_location(), None);
    }

    #[test]
    fn init_is_idempotent() {
        init_observability_with(ObservabilityConfig {
            enabled: false,
            ..ObservabilityConfig::default()
        });
        init_observability();
        let span = session_span(&uuid::Uuid::nil(), WireFormat::JsonLines, "fake://logs");
        let _entered = span.enter();
        tracing::debug!("observability initialized twice");
    }
}

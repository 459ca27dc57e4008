//! Logging setup for ShareKit binaries and tests.
//!
//! Events from the ShareKit crates pass at the configured level. Everything
//! else (reqwest, hyper, ...) is held at `warn` unless `RUST_LOG` or an
//! explicit filter says otherwise.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Log targets owned by this workspace.
pub const SHAREKIT_TARGETS: &[&str] = &[
    "sharekit",
    "sharekit_common",
    "sharekit_net",
    "sharekit_cache",
    "sharekit_idb",
    "sharekit_sw",
];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, with targets and optional source locations.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for ShareKit targets.
    pub level: Level,
    pub format: LogFormat,
    /// Include source file and line.
    pub include_location: bool,
    /// Log span enter and close.
    pub include_span_events: bool,
    /// Filter directives replacing the default, e.g. `"sharekit_idb=trace"`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Configuration for the command-line flags `--verbose` and `--json-logs`.
    ///
    /// Verbose output is debug level with locations and span events. JSON
    /// output keeps the chosen level but drops the human-oriented extras.
    pub fn from_flags(verbose: bool, json: bool) -> Self {
        let mut config = if verbose {
            Self {
                level: Level::DEBUG,
                format: LogFormat::Pretty,
                include_location: true,
                include_span_events: true,
                filter: None,
            }
        } else {
            Self::default()
        };

        if json {
            config.format = LogFormat::Json;
            config.include_span_events = false;
        }
        config
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Filter directives in effect when neither `RUST_LOG` nor a custom
    /// filter is set.
    pub fn default_directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directives = String::from("warn");
        for target in SHAREKIT_TARGETS {
            directives.push_str(&format!(",{}={}", target, level));
        }
        directives
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_directives());
        match self.filter {
            Some(ref custom) => EnvFilter::try_new(custom).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(false)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_file(self.include_location)
                .with_line_number(self.include_location)
                .boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Fails if one is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.env_filter())
        .try_init()
}

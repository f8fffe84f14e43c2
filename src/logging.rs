//! Logging setup via [`tracing`] crate.
//!
//! Each configured sink becomes one `tracing-subscriber` layer with its own filter, writing
//! through a non-blocking `tracing-appender` worker.

use std::{collections::BTreeMap, fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::{
    non_blocking::{NonBlockingBuilder, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{self, writer::BoxMakeWriter},
    layer::{Layer, Layered, SubscriberExt},
    registry::{LookupSpan, Registry},
    util::{SubscriberInitExt, TryInitError},
};

/// Event target of the resource pool crate.
const POOL_TARGET: &str = "fleetkit_resourcepool";

type SinkLayer<S> = Box<dyn Layer<S> + Send + Sync>;

type LoggingRegistry = Layered<Vec<SinkLayer<Registry>>, Registry>;

/// Error type used in logging setup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggingError {
    /// Unable to open log file.
    #[error("Unable to open log file: {0}")]
    Open(#[from] io::Error),
    /// Unable to set up log directory.
    #[error("Unable to set up log directory: {0}")]
    Directory(#[from] tracing_appender::rolling::InitError),
    /// Global subscriber was already installed.
    #[error("Unable to install global log subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LoggingConfig {
    /// Log sinks. No sinks means no log output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sinks: Vec<LogSink>,
}

impl LoggingConfig {
    /// Build a registry with one layer per sink.
    ///
    /// Returned guards flush buffered log lines when dropped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the sinks cannot be opened.
    pub fn make_registry(&self) -> Result<(LoggingRegistry, Vec<WorkerGuard>), LoggingError> {
        let (layers, guards): (Vec<_>, Vec<_>) = self
            .sinks
            .iter()
            .map(LogSink::make_layer)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();
        Ok((Registry::default().with(layers), guards))
    }

    /// Build sinks and install them as the global default subscriber.
    ///
    /// Returned guards must be kept alive for as long as logging is needed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any of the sinks cannot be opened, or if a global subscriber is already
    /// installed.
    pub fn init(&self) -> Result<Vec<WorkerGuard>, LoggingError> {
        let (registry, guards) = self.make_registry()?;
        registry.try_init()?;
        Ok(guards)
    }
}

/// Single log sink.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct LogSink {
    /// Output format.
    #[serde(default, flatten)]
    pub format: LogFormat,
    /// Minimum severity level of events.
    #[serde(default)]
    pub level: LoggingLevel,
    /// Minimum severity level of pool bookkeeping events: allocations, evictions and releases.
    ///
    /// Overrides `level` for the pool crate. More specific entries in `targets` take precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_level: Option<LoggingLevel>,
    /// Minimum severity levels for specific event targets, e.g. `fleetkit::peer`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub targets: BTreeMap<String, LoggingLevel>,
    /// Colorize output with ANSI escape sequences.
    #[serde(default)]
    pub color: bool,
    /// Event metadata to include in output.
    #[serde(default)]
    pub metadata: LogMetadata,
    /// Queue between the application and the writer thread.
    #[serde(default)]
    pub queue: LogQueue,
    /// Where to write.
    #[serde(default)]
    pub output: LogOutput,
}

impl LogSink {
    /// Verbose colored sink writing to stderr, for debugging agents locally.
    #[must_use]
    pub fn development() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: LoggingLevel::Trace,
            color: true,
            metadata: LogMetadata {
                target: true,
                location: true,
                level: true,
            },
            output: LogOutput::Stderr,
            ..Default::default()
        }
    }

    /// Event filter of the sink.
    #[must_use]
    pub fn filter(&self) -> Targets {
        let mut filter = Targets::new().with_default(LevelFilter::from(self.level));
        if let Some(level) = self.pool_level {
            filter = filter.with_target(POOL_TARGET, LevelFilter::from(level));
        }
        filter.with_targets(
            self.targets
                .iter()
                .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
        )
    }

    /// Open the output and make a filtered [`tracing_subscriber::Layer`] writing to it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the output cannot be opened.
    pub fn make_layer<S>(&self) -> Result<(SinkLayer<S>, WorkerGuard), LoggingError>
    where
        S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    {
        let (writer, guard) = self.output.open(self.queue.builder())?;
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.color)
            .with_target(self.metadata.target)
            .with_file(self.metadata.location)
            .with_line_number(self.metadata.location)
            .with_level(self.metadata.level);
        let layer = match self.format {
            LogFormat::Full => layer.boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Json { flatten, spans } => layer
                .json()
                .flatten_event(flatten)
                .with_current_span(spans)
                .with_span_list(spans)
                .boxed(),
        };
        Ok((layer.with_filter(self.filter()).boxed(), guard))
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase", tag = "format")]
pub enum LogFormat {
    /// Single line, with span context before the message.
    #[default]
    Full,
    /// Single line, span names hidden.
    Compact,
    /// Multiline, for humans.
    Pretty,
    /// Newline-delimited JSON objects.
    Json {
        /// Put event fields at the top level of the object.
        #[serde(default)]
        flatten: bool,
        /// Include the current span and the span stack, e.g. `peer_connection` and
        /// `pool_acquire`.
        #[serde(default)]
        spans: bool,
    },
}

/// Minimum event severity.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    /// Nothing.
    Off,
    ///
    Error,
    ///
    Warn,
    ///
    #[default]
    Info,
    /// Includes allocations and evictions of pooled resources.
    Debug,
    /// Everything.
    Trace,
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::Off => Self::OFF,
            LoggingLevel::Error => Self::ERROR,
            LoggingLevel::Warn => Self::WARN,
            LoggingLevel::Info => Self::INFO,
            LoggingLevel::Debug => Self::DEBUG,
            LoggingLevel::Trace => Self::TRACE,
        }
    }
}

/// Event metadata to include in output.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct LogMetadata {
    /// Event target, usually the module path.
    #[serde(default)]
    pub target: bool,
    /// Source file and line.
    #[serde(default)]
    pub location: bool,
    /// Severity level.
    #[serde(default = "crate::util::default_true")]
    pub level: bool,
}

impl Default for LogMetadata {
    fn default() -> Self {
        Self {
            target: false,
            location: false,
            level: true,
        }
    }
}

/// Queue of a non-blocking log writer.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct LogQueue {
    /// Maximum number of queued lines.
    #[serde(default = "LogQueue::default_lines")]
    pub lines: usize,
    /// Drop lines when the queue is full, instead of blocking the logging thread.
    #[serde(default = "crate::util::default_true")]
    pub lossy: bool,
}

impl Default for LogQueue {
    fn default() -> Self {
        Self {
            lines: Self::default_lines(),
            lossy: true,
        }
    }
}

impl LogQueue {
    #[inline]
    fn default_lines() -> usize {
        128_000
    }

    fn builder(self) -> NonBlockingBuilder {
        NonBlockingBuilder::default()
            .buffered_lines_limit(self.lines)
            .lossy(self.lossy)
            .thread_name("fleetkit-log")
    }
}

/// Where to write log lines.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LogOutput {
    ///
    #[default]
    Stdout,
    ///
    Stderr,
    /// Single file, appended to.
    File {
        /// Path to log file.
        path: PathBuf,
    },
    /// Directory of rotated `.log` files.
    Directory(LogDirectory),
}

impl LogOutput {
    fn open(
        &self,
        queue: NonBlockingBuilder,
    ) -> Result<(BoxMakeWriter, WorkerGuard), LoggingError> {
        let (writer, guard) = match self {
            Self::Stdout => queue.finish(io::stdout()),
            Self::Stderr => queue.finish(io::stderr()),
            Self::File { path } => {
                let file = fs::OpenOptions::new().append(true).create(true).open(path)?;
                queue.finish(file)
            }
            Self::Directory(dir) => queue.finish(dir.appender()?),
        };
        Ok((BoxMakeWriter::new(writer), guard))
    }
}

/// Directory of rotated log files.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LogDirectory {
    /// Directory path.
    pub path: PathBuf,
    /// How often to start a new file.
    #[serde(default)]
    pub rotate: LogRotation,
    /// File name prefix.
    #[serde(default = "LogDirectory::default_prefix")]
    pub prefix: String,
    /// Number of files to keep. Older files are deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<usize>,
}

impl LogDirectory {
    /// Rotated files in `path`, with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rotate: LogRotation::default(),
            prefix: Self::default_prefix(),
            keep: None,
        }
    }

    fn default_prefix() -> String {
        "agent".into()
    }

    fn appender(&self) -> Result<RollingFileAppender, LoggingError> {
        let mut builder = RollingFileAppender::builder()
            .rotation(self.rotate.into())
            .filename_prefix(&self.prefix)
            .filename_suffix("log");
        if let Some(keep) = self.keep {
            builder = builder.max_log_files(keep);
        }
        builder.build(&self.path).map_err(Into::into)
    }
}

/// Log file rotation period.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    ///
    Hourly,
    ///
    #[default]
    Daily,
    /// Keep writing to one file.
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(value: LogRotation) -> Self {
        match value {
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

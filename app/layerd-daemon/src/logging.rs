//! Process-wide logging setup.
//!
//! [`init`] installs the global tracing subscriber exactly once and routes
//! records from the `log` facade (used by lower-level libraries) into it,
//! always at `DEBUG`.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use layerd_core::{DaemonError, FATAL_TARGET};
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// RFC 3339 with fixed nanosecond precision, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Supported log severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    pub const ALL: [LogLevel; 7] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Fatal,
        LogLevel::Panic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Panic => "panic",
        }
    }

    /// Maximum tracing level emitted at this severity.
    ///
    /// tracing has nothing above `ERROR`, so `fatal` and `panic` share it.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => LevelFilter::ERROR,
        }
    }

    /// Whether a record or span with `meta` is emitted at this severity.
    ///
    /// `fatal` and `panic` only admit records logged with [`FATAL_TARGET`].
    pub fn admits(self, meta: &tracing::Metadata<'_>) -> bool {
        if self.level_filter() < *meta.level() {
            return false;
        }
        match self {
            LogLevel::Fatal | LogLevel::Panic => meta.target() == FATAL_TARGET,
            _ => true,
        }
    }

    /// `log` facade filter for the debug-pinned bridge.
    fn bridge_filter(self) -> log::LevelFilter {
        if self.level_filter() >= LevelFilter::DEBUG {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Off
        }
    }
}

impl FromStr for LogLevel {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DaemonError::LogLevelParse(s.to_owned()))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output encoding for log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable text.
    Text,
}

/// Install the global subscriber at `level` in `format`.
///
/// Fails with [`DaemonError::LoggerInstall`] if a subscriber or `log` logger
/// is already installed.
pub fn init(level: LogLevel, format: LogFormat) -> Result<(), DaemonError> {
    tracing::subscriber::set_global_default(subscriber(level, format, std::io::stderr))
        .map_err(|e| DaemonError::LoggerInstall(e.to_string()))?;

    log::set_boxed_logger(Box::new(DebugBridge))
        .map_err(|e| DaemonError::LoggerInstall(e.to_string()))?;
    log::set_max_level(level.bridge_filter());
    Ok(())
}

/// Subscriber writing records admitted at `level` to `writer` in `format`.
pub fn subscriber<W>(
    level: LogLevel,
    format: LogFormat,
    writer: W,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let timer = ChronoUtc::new(TIMESTAMP_FORMAT.to_owned());
    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_timer(timer)
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_timer(timer)
            .with_writer(writer)
            .boxed(),
    };
    let filter =
        filter_fn(move |meta| level.admits(meta)).with_max_level_hint(level.level_filter());
    tracing_subscriber::registry().with(layer.with_filter(filter))
}

/// Forwards every `log` record to tracing at `DEBUG`, whatever its original
/// level.
struct DebugBridge;

impl log::Log for DebugBridge {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        tracing::enabled!(Level::DEBUG)
    }

    fn log(&self, record: &log::Record<'_>) {
        tracing::debug!(
            target: "log",
            origin = record.target(),
            original_level = %record.level(),
            "{}",
            record.args()
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under a text subscriber at `level` and return what it wrote.
    fn captured(level: LogLevel, f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let writer = capture.clone();
        tracing::subscriber::with_default(
            subscriber(level, LogFormat::Text, move || writer.clone()),
            f,
        );
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn legacy_error() {
        log::Log::log(
            &DebugBridge,
            &log::Record::builder()
                .level(log::Level::Error)
                .target("legacy")
                .args(format_args!("disk almost full"))
                .build(),
        );
    }

    #[test]
    fn every_supported_level_parses_to_itself() {
        for level in LogLevel::ALL {
            assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
            assert_eq!(
                level.as_str().to_uppercase().parse::<LogLevel>().unwrap(),
                level
            );
        }
    }

    #[test]
    fn levels_map_to_exact_filters() {
        assert_eq!(LogLevel::Trace.level_filter(), LevelFilter::TRACE);
        assert_eq!(LogLevel::Debug.level_filter(), LevelFilter::DEBUG);
        assert_eq!(LogLevel::Info.level_filter(), LevelFilter::INFO);
        assert_eq!(LogLevel::Warn.level_filter(), LevelFilter::WARN);
        assert_eq!(LogLevel::Error.level_filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::Fatal.level_filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::Panic.level_filter(), LevelFilter::ERROR);
    }

    #[test]
    fn unknown_levels_are_rejected() {
        for bad in ["", "verbose", "warning", "information", "5", "info "] {
            let err = bad.parse::<LogLevel>().unwrap_err();
            assert!(matches!(err, DaemonError::LogLevelParse(ref s) if s == bad));
        }
    }

    #[test]
    fn bridge_only_passes_records_when_debug_is_enabled() {
        assert_eq!(LogLevel::Trace.bridge_filter(), log::LevelFilter::Trace);
        assert_eq!(LogLevel::Debug.bridge_filter(), log::LevelFilter::Trace);
        assert_eq!(LogLevel::Info.bridge_filter(), log::LevelFilter::Off);
        assert_eq!(LogLevel::Panic.bridge_filter(), log::LevelFilter::Off);
    }

    #[test]
    fn timestamp_format_has_fixed_nanoseconds() {
        use tracing_subscriber::fmt::format::Writer;
        use tracing_subscriber::fmt::time::FormatTime;

        let mut out = String::new();
        ChronoUtc::new(TIMESTAMP_FORMAT.to_owned())
            .format_time(&mut Writer::new(&mut out))
            .unwrap();
        // e.g. 2024-05-01T12:34:56.000001234Z
        assert_eq!(out.len(), 30, "{out}");
        assert!(out.ends_with('Z'));
    }

    #[test]
    fn bridged_records_are_emitted_at_debug_with_original_level() {
        let out = captured(LogLevel::Debug, legacy_error);
        assert!(out.contains(" DEBUG "), "{out}");
        assert!(!out.contains(" ERROR "), "{out}");
        assert!(out.contains("disk almost full"), "{out}");
        assert!(out.contains("original_level=ERROR"), "{out}");
        assert!(out.contains("origin=\"legacy\""), "{out}");
    }

    #[test]
    fn bridged_records_are_dropped_above_debug() {
        let out = captured(LogLevel::Info, legacy_error);
        assert!(out.is_empty(), "{out}");
    }

    #[test]
    fn fatal_level_admits_only_fatal_records() {
        let emit = || {
            tracing::error!("ordinary error");
            tracing::error!(target: FATAL_TARGET, "process ending");
        };
        for level in [LogLevel::Fatal, LogLevel::Panic] {
            let out = captured(level, emit);
            assert!(!out.contains("ordinary error"), "{level}: {out}");
            assert!(out.contains("process ending"), "{level}: {out}");
        }

        let out = captured(LogLevel::Error, emit);
        assert!(out.contains("ordinary error"), "{out}");
        assert!(out.contains("process ending"), "{out}");
    }

    #[test]
    fn json_format_writes_one_object_per_record() {
        let capture = Capture::default();
        let writer = capture.clone();
        tracing::subscriber::with_default(
            subscriber(LogLevel::Info, LogFormat::Json, move || writer.clone()),
            || tracing::info!(socket = "/run/layerd/layerd.sock", "serving"),
        );
        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["message"], "serving");
        assert_eq!(line["socket"], "/run/layerd/layerd.sock");
    }
}

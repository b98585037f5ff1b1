use tracing::span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Trace,
    Info,
    Debug,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_log_level(&self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Trace,
        }
    }
}

const SPAN_NAME: &str = "realtime";

pub struct Logger;

impl Logger {
    /// Install the global fmt subscriber. Returns false when one is already set.
    pub fn init(level: LogLevel) -> bool {
        tracing_subscriber::fmt()
            .with_max_level(level.to_log_level())
            .with_target(false)
            .try_init()
            .is_ok()
    }

    pub fn with_span<T>(f: impl FnOnce() -> T) -> T {
        let span = span!(tracing::Level::INFO, SPAN_NAME);
        let _guard = span.enter();
        f()
    }
}

pub fn setup_logger(level: &str) -> bool {
    Logger::init(LogLevel::parse(level))
}

//! Named loggers on top of `tracing`.
//!
//! The process has one global subscriber. Each box owns a
//! [`TracingLogFactory`] that retunes the global filter and attaches its
//! broadcast/platform sinks for as long as the box lives.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use crate::adapter::PlatformInterface;
use crate::api::log_broadcast::{LogBroadcaster, LogEntry, MessageVisitor};
use crate::config::types::LogOptions;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "fatal" | "panic" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Level names used by the clash log stream.
    pub fn clash_name(&self) -> &'static str {
        match self {
            Self::Trace | Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warning",
            Self::Error => "error",
        }
    }

    fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// A cheap, cloneable named logging handle.
#[derive(Clone, Debug)]
pub struct Logger {
    name: Arc<str>,
}

impl Logger {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace(&self, message: impl fmt::Display) {
        tracing::trace!(logger = %self.name, "{}", message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!(logger = %self.name, "{}", message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        tracing::info!(logger = %self.name, "{}", message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        tracing::warn!(logger = %self.name, "{}", message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!(logger = %self.name, "{}", message);
    }
}

pub trait LogFactory: Send + Sync {
    fn new_logger(&self, name: &str) -> Logger;

    /// The top-level logger of the box.
    fn logger(&self) -> Logger;

    /// Live log stream; `None` unless the factory was built observable.
    fn subscribe(&self) -> Option<broadcast::Receiver<LogEntry>> {
        None
    }

    fn close(&self) -> Result<()>;
}

pub struct LogFactoryOptions {
    pub options: LogOptions,
    /// Keep a broadcast stream of log entries for the control API.
    pub observable: bool,
    /// Suppress the stdout writer (the platform owns output).
    pub discard_default: bool,
    pub platform: Option<Arc<dyn PlatformInterface>>,
}

struct ActiveSinks {
    owner: u64,
    broadcaster: Option<LogBroadcaster>,
    platform: Option<Arc<dyn PlatformInterface>>,
}

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);
static CONSOLE_ENABLED: AtomicBool = AtomicBool::new(true);
static TIMESTAMP_ENABLED: AtomicBool = AtomicBool::new(false);
static ACTIVE_SINKS: RwLock<Option<ActiveSinks>> = RwLock::new(None);
static FILTER: OnceLock<Option<reload::Handle<EnvFilter, Registry>>> = OnceLock::new();

/// 基于 tracing 的日志工厂
pub struct TracingLogFactory {
    id: u64,
    root: Logger,
    broadcaster: Option<LogBroadcaster>,
    closed: AtomicBool,
}

impl TracingLogFactory {
    pub fn new(options: LogFactoryOptions) -> Result<Self> {
        let filter = build_filter(&options.options)?;

        CONSOLE_ENABLED.store(
            !options.discard_default && !options.options.disabled,
            Ordering::Relaxed,
        );
        TIMESTAMP_ENABLED.store(options.options.timestamp, Ordering::Relaxed);

        let mut pending = Some(filter);
        let handle = FILTER.get_or_init(|| install_global(pending.take()));
        if let (Some(handle), Some(filter)) = (handle, pending) {
            handle
                .reload(filter)
                .map_err(|e| anyhow::anyhow!("reload log filter: {}", e))?;
        }

        let id = NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed);
        let broadcaster = options
            .observable
            .then(|| LogBroadcaster::new(BROADCAST_CAPACITY));
        *ACTIVE_SINKS.write().unwrap_or_else(PoisonError::into_inner) = Some(ActiveSinks {
            owner: id,
            broadcaster: broadcaster.clone(),
            platform: options.platform,
        });

        Ok(Self {
            id,
            root: Logger::new("proxybox"),
            broadcaster,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_observable(&self) -> bool {
        self.broadcaster.is_some()
    }
}

impl LogFactory for TracingLogFactory {
    fn new_logger(&self, name: &str) -> Logger {
        Logger::new(name)
    }

    fn logger(&self) -> Logger {
        self.root.clone()
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<LogEntry>> {
        self.broadcaster.as_ref().map(LogBroadcaster::subscribe)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sinks = ACTIVE_SINKS.write().unwrap_or_else(PoisonError::into_inner);
        if sinks.as_ref().map(|s| s.owner) == Some(self.id) {
            *sinks = None;
        }
        Ok(())
    }
}

fn build_filter(options: &LogOptions) -> Result<EnvFilter> {
    if options.disabled {
        return Ok(EnvFilter::new("off"));
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = LogLevel::parse(&options.level)
        .ok_or_else(|| anyhow::anyhow!("unknown log level: {}", options.level))?;
    Ok(EnvFilter::new(level.as_str()))
}

/// Installs the process-wide subscriber. Returns `None` when another
/// subscriber is already installed; loggers then go to that one.
fn install_global(filter: Option<EnvFilter>) -> Option<reload::Handle<EnvFilter, Registry>> {
    let (filter, handle) = reload::Layer::new(filter.unwrap_or_else(|| EnvFilter::new("info")));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(ConsoleWriter)
        .with_timer(OptionalTime);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ForwardLayer)
        .try_init()
        .ok()
        .map(|_| handle)
}

struct ConsoleWriter;

impl<'a> MakeWriter<'a> for ConsoleWriter {
    type Writer = Box<dyn std::io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        if CONSOLE_ENABLED.load(Ordering::Relaxed) {
            Box::new(std::io::stdout())
        } else {
            Box::new(std::io::sink())
        }
    }
}

struct OptionalTime;

impl FormatTime for OptionalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        if TIMESTAMP_ENABLED.load(Ordering::Relaxed) {
            tracing_subscriber::fmt::time::SystemTime.format_time(w)
        } else {
            Ok(())
        }
    }
}

/// Forwards events to the sinks of the currently active factory.
struct ForwardLayer;

impl<S> Layer<S> for ForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let sinks = ACTIVE_SINKS.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sinks) = sinks.as_ref() else {
            return;
        };
        if sinks.broadcaster.is_none() && sinks.platform.is_none() {
            return;
        }

        let level = LogLevel::from_tracing(event.metadata().level());
        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);
        let payload = visitor.format_output();

        if let Some(platform) = &sinks.platform {
            platform.write_log(level, &payload);
        }
        if let Some(broadcaster) = &sinks.broadcaster {
            broadcaster.send(LogEntry::new(level, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse() {
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("panic"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn unknown_level_is_rejected() {
        let options = LogOptions {
            level: "loud".to_string(),
            ..Default::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(build_filter(&options).is_err());
        }
    }

    #[test]
    fn factory_names_loggers_and_closes_once() {
        let factory = TracingLogFactory::new(LogFactoryOptions {
            options: LogOptions::default(),
            observable: true,
            discard_default: false,
            platform: None,
        })
        .unwrap();
        assert!(factory.is_observable());
        assert!(factory.subscribe().is_some());
        assert_eq!(factory.new_logger("inbound/direct[0]").name(), "inbound/direct[0]");
        assert_eq!(factory.logger().name(), "proxybox");
        assert!(factory.close().is_ok());
        assert!(factory.close().is_ok());
    }
}

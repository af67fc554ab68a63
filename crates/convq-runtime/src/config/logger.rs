use super::{cache::CacheLogLevel, pass::PassLogLevel, GlobalConfig};
use alloc::{sync::Arc, vec::Vec};
use core::fmt::Display;
use hashbrown::HashMap;

#[cfg(std_io)]
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Configuration for logging in convq, parameterized by a log level type.
///
/// Note that you can use multiple loggers at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled.
    #[serde(default)]
    #[cfg(std_io)]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            #[cfg(std_io)]
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

/// Binary log level for enabling or disabling logging.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryLogLevel {
    /// Logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Logging is fully enabled.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for BinaryLogLevel {}

/// Central logging utility for convq, managing multiple log outputs.
#[derive(Debug)]
pub struct Logger {
    loggers: Vec<LoggerKind>,
    cache_index: Vec<usize>,
    pass_index: Vec<usize>,

    /// Global configuration for logging settings.
    pub config: Arc<GlobalConfig>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Hash, PartialEq, Eq)]
enum LoggerId {
    #[cfg(std_io)]
    File(PathBuf),
    #[cfg(feature = "std")]
    Stdout,
    #[cfg(feature = "std")]
    Stderr,
    LogCrate(LogCrateLevel),
}

impl Logger {
    /// Creates a new `Logger` instance based on the global configuration.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Creates a new `Logger` instance for the provided configuration.
    ///
    /// Sinks shared between categories, like the same file, are only opened once.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        let mut loggers = Vec::new();
        let mut cache_index = Vec::new();
        let mut pass_index = Vec::new();
        let mut logger2index = HashMap::<LoggerId, usize>::new();

        if config.cache.logger.level != CacheLogLevel::Disabled {
            register_logger(
                &config.cache.logger,
                &mut cache_index,
                &mut loggers,
                &mut logger2index,
            );
        }

        if let PassLogLevel::Full = config.pass.logger.level {
            register_logger(
                &config.pass.logger,
                &mut pass_index,
                &mut loggers,
                &mut logger2index,
            );
        }

        Self {
            loggers,
            cache_index,
            pass_index,
            config,
        }
    }

    /// Logs a message for the cache, directing it to all configured cache loggers.
    pub fn log_cache<S: Display>(&mut self, msg: &S) {
        for i in 0..self.cache_index.len() {
            let index = self.cache_index[i];
            self.loggers[index].log(msg);
        }
    }

    /// Logs a message for the graph passes, directing it to all configured pass loggers.
    pub fn log_pass<S: Display>(&mut self, msg: &S) {
        for i in 0..self.pass_index.len() {
            let index = self.pass_index[i];
            self.loggers[index].log(msg);
        }
    }

    /// Returns true if at least one sink receives cache messages.
    pub fn cache_activated(&self) -> bool {
        !self.cache_index.is_empty()
    }

    /// Returns true if at least one sink receives pass messages.
    pub fn pass_activated(&self) -> bool {
        !self.pass_index.is_empty()
    }

    /// Returns the current cache log level from the configuration.
    pub fn log_level_cache(&self) -> CacheLogLevel {
        self.config.cache.logger.level
    }

    /// Returns the current pass log level from the configuration.
    pub fn log_level_pass(&self) -> PassLogLevel {
        self.config.pass.logger.level
    }
}

fn register_logger<L: LogLevel>(
    config: &LoggerConfig<L>,
    setting_index: &mut Vec<usize>,
    loggers: &mut Vec<LoggerKind>,
    logger2index: &mut HashMap<LoggerId, usize>,
) {
    let mut add = |id: LoggerId, create: &dyn Fn() -> Option<LoggerKind>| {
        if let Some(index) = logger2index.get(&id) {
            setting_index.push(*index);
        } else if let Some(logger) = create() {
            let index = loggers.len();
            logger2index.insert(id, index);
            loggers.push(logger);
            setting_index.push(index);
        }
    };

    #[cfg(std_io)]
    if let Some(file) = &config.file {
        add(LoggerId::File(file.clone()), &|| {
            FileLogger::new(file, config.append).map(LoggerKind::File)
        });
    }

    #[cfg(feature = "std")]
    if config.stdout {
        add(LoggerId::Stdout, &|| Some(LoggerKind::Stdout));
    }

    #[cfg(feature = "std")]
    if config.stderr {
        add(LoggerId::Stderr, &|| Some(LoggerKind::Stderr));
    }

    if let Some(level) = config.log {
        add(LoggerId::LogCrate(level), &|| Some(LoggerKind::Log(level)));
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    #[cfg(std_io)]
    File(FileLogger),

    /// Logs to standard output.
    #[cfg(feature = "std")]
    Stdout,

    /// Logs to standard error.
    #[cfg(feature = "std")]
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            #[cfg(std_io)]
            LoggerKind::File(file_logger) => file_logger.log(msg),
            #[cfg(feature = "std")]
            LoggerKind::Stdout => println!("{msg}"),
            #[cfg(feature = "std")]
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
#[cfg(std_io)]
struct FileLogger {
    writer: BufWriter<File>,
}

#[cfg(std_io)]
impl FileLogger {
    // A log file that can't be opened disables the sink instead of failing inference.
    fn new(path: &PathBuf, append: bool) -> Option<Self> {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path);

        match file {
            Ok(file) => Some(Self {
                writer: BufWriter::new(file),
            }),
            Err(err) => {
                log::warn!("Unable to open log file '{}': {err}", path.display());
                None
            }
        }
    }

    fn log<S: Display>(&mut self, msg: &S) {
        let written = writeln!(self.writer, "{msg}").and_then(|_| self.writer.flush());
        if let Err(err) = written {
            log::warn!("Unable to write to log file: {err}");
        }
    }
}

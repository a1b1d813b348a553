use std::fs::{ File, OpenOptions };
use std::io::{ self, Write };
use std::str::FromStr;
use std::sync::Mutex;
use chrono::Utc;
//  order of log (Debug < Info < Warning < Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(&self) -> &str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other =>
                Err(
                    format!("Invalid log level: {}. Valid options: debug, info, warning, error", other)
                ),
        }
    }
}

enum Sink {
    File(File),
    Memory(Vec<String>),
    Disabled,
}

/// Leveled, timestamped logger shared between the engine and the main loop.
///
/// Never touched from the audio data callbacks.
pub struct Logger {
    sink: Mutex<Sink>,
    min_level: LogLevel,
    echo_stderr: bool,
}

impl Logger {
    pub fn to_file(file_path: &str, min_level: LogLevel) -> Result<Self, io::Error> {
        if let Some(dir) = std::path::Path::new(file_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        Ok(Logger {
            sink: Mutex::new(Sink::File(file)),
            min_level,
            echo_stderr: false,
        })
    }

    /// Keeps formatted lines in memory; see [`Logger::lines`].
    pub fn in_memory(min_level: LogLevel) -> Self {
        Logger {
            sink: Mutex::new(Sink::Memory(Vec::new())),
            min_level,
            echo_stderr: false,
        }
    }

    pub fn disabled() -> Self {
        Logger {
            sink: Mutex::new(Sink::Disabled),
            min_level: LogLevel::Error,
            echo_stderr: false,
        }
    }

    /// Mirror every accepted line to stderr as well.
    pub fn with_stderr(mut self, echo: bool) -> Self {
        self.echo_stderr = echo;
        self
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), io::Error> {
        if !self.should_log(level) {
            return Ok(());
        }

        let timestamp = Utc::now();
        let formatted_message = format!(
            "[{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            level.as_str(),
            message
        );

        if self.echo_stderr {
            eprintln!("{}", message);
        }

        let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *sink {
            Sink::File(file) => {
                writeln!(file, "{}", formatted_message)?;
                file.flush()?;
            }
            Sink::Memory(lines) => lines.push(formatted_message),
            Sink::Disabled => {}
        }
        Ok(())
    }

    pub fn log_fmt(&self, level: LogLevel, args: std::fmt::Arguments) -> Result<(), io::Error> {
        if !self.should_log(level) {
            return Ok(());
        }
        self.log(level, &format!("{}", args))
    }

    pub fn info(&self, message: &str) -> Result<(), io::Error> {
        self.log(LogLevel::Info, message)
    }

    pub fn info_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Info, args)
    }
    pub fn warn_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Warning, args)
    }
    pub fn error_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Error, args)
    }
    pub fn debug_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Debug, args)
    }

    /// Lines captured by an in-memory logger (empty for other sinks).
    pub fn lines(&self) -> Vec<String> {
        match &*self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) {
            Sink::Memory(lines) => lines.clone(),
            _ => Vec::new(),
        }
    }
}

#[macro_export]
macro_rules! log_info {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.info_fmt(format_args!($($arg)*))
    };
}
#[macro_export]
macro_rules! log_warn {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.warn_fmt(format_args!($($arg)*))
    };
}
#[macro_export]
macro_rules! log_error {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.error_fmt(format_args!($($arg)*))
    };
}
#[macro_export]
macro_rules! log_debug {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.debug_fmt(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_drops_lower_levels() {
        let logger = Logger::in_memory(LogLevel::Warning);
        logger.info("calibrated").unwrap();
        logger.log(LogLevel::Warning, "resync").unwrap();
        logger.log(LogLevel::Error, "stream error").unwrap();

        let lines = logger.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[WARN] resync"));
        assert!(lines[1].contains("[ERROR] stream error"));
    }

    #[test]
    fn macros_format_arguments() {
        let logger = Logger::in_memory(LogLevel::Debug);
        log_debug!(logger, "fft kernel {}", 512).unwrap();
        log_info!(logger, "step {:.3}", 0.025).unwrap();

        let lines = logger.lines();
        assert!(lines[0].ends_with("[DEBUG] fft kernel 512"));
        assert!(lines[1].ends_with("[INFO] step 0.025"));
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains(" UTC] "));
    }

    #[test]
    fn disabled_logger_accepts_everything_silently() {
        let logger = Logger::disabled();
        assert!(logger.log(LogLevel::Error, "ignored").is_ok());
        assert!(logger.lines().is_empty());
    }

    #[test]
    fn parse_levels() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}

use chrono::Local;
use std::fmt;

#[derive(Debug, Clone, Copy)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Timestamped line logging. Warnings and errors go to stderr so backup
/// failures stay visible when stdout is captured.
pub fn log(level: Level, args: fmt::Arguments) {
    let line = format!("[{}] {} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), level.tag(), args);
    match level {
        Level::Info => println!("{}", line),
        Level::Warn | Level::Error => eprintln!("{}", line),
    }
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::Level::Error, format_args!($($arg)*))
    };
}

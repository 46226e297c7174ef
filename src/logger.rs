//! Injected logging capability.
//!
//! Components never call a global logger directly; each one holds an
//! `Arc<dyn Logger>` handed over at construction. [`default_logger`] forwards
//! to the `log` facade, [`Discard`] silences a component entirely.

use log::Level;
use std::fmt;
use std::sync::Arc;

/// Leveled print calls used for diagnostics only.
pub trait Logger: Send + Sync {
    fn print(&self, level: Level, args: fmt::Arguments<'_>);

    fn print_str(&self, level: Level, msg: &str) {
        self.print(level, format_args!("{}", msg))
    }
}

/// Forwards to the `log` facade under a fixed target.
#[derive(Clone, Debug)]
pub struct StdLogger {
    target: &'static str,
}

impl StdLogger {
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }
}

impl Default for StdLogger {
    fn default() -> Self {
        Self::new("revdial")
    }
}

impl Logger for StdLogger {
    fn print(&self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(target: self.target, level, "{}", args);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl Logger for Discard {
    fn print(&self, _level: Level, _args: fmt::Arguments<'_>) {}
}

/// The logger components use unless told otherwise.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(StdLogger::default())
}

macro_rules! emit {
    ($logger:expr, $level:ident, $($arg:tt)+) => {
        $logger.print(::log::Level::$level, format_args!($($arg)+))
    };
}

pub(crate) use emit;

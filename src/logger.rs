use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::env;
use std::fmt::Write as _;
use std::io::Write as _;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Overrides the level filter programmatically. Embedders call this instead
/// of going through `TUNNEL_LOG`; tests use it to quiet or widen output.
pub fn set_level(level: LogLevel) {
    LOGGER.state.lock().min_level = level;
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.state.lock().breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const TCP        = 0b0000_0001;
        const OVERLAY     = 0b0000_0010;
        const ENGINE      = 0b0000_0100;
        const SUPERVISOR  = 0b0000_1000;
        const DIAL        = 0b0001_0000;
        const ALL         = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct LogState {
    min_level: LogLevel,
    breadcrumbs: BreadcrumbFlags,
}

struct LogManager {
    state: Mutex<LogState>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        let min_level = env::var("TUNNEL_LOG")
            .ok()
            .map(|v| LogLevel::from_str(&v))
            .unwrap_or(LogLevel::Info);
        let breadcrumbs = env::var("TUNNEL_BREADCRUMBS")
            .ok()
            .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok())
            .map(BreadcrumbFlags::from_bits_truncate)
            .unwrap_or(BreadcrumbFlags::empty());
        Self {
            state: Mutex::new(LogState {
                min_level,
                breadcrumbs,
            }),
            prefix: format!("[tunnelmux-p{pid}]"),
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let state = self.state.lock();
        if breadcrumbs.is_empty() {
            if level > state.min_level {
                return;
            }
        } else if !state.breadcrumbs.intersects(breadcrumbs) {
            return;
        }
        drop(state);

        let mut formatted = String::new();
        if breadcrumbs.is_empty() {
            let _ = write!(formatted, "{} {} {}", self.prefix, level.as_str(), message);
        } else {
            let _ = write!(
                formatted,
                "{} {} [{}] {}",
                self.prefix,
                level.as_str(),
                label_for(breadcrumbs),
                message
            );
        }
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "{formatted}");
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::ENGINE) {
        "ENGINE"
    } else if flags.contains(BreadcrumbFlags::TCP) {
        "TCP"
    } else if flags.contains(BreadcrumbFlags::OVERLAY) {
        "OVERLAY"
    } else if flags.contains(BreadcrumbFlags::SUPERVISOR) {
        "SUPERVISOR"
    } else if flags.contains(BreadcrumbFlags::DIAL) {
        "DIAL"
    } else {
        "LOG"
    }
}

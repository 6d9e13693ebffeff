//! Log sink setup: `env_logger` to stderr for foreground runs, or syslog's
//! `DAEMON` facility with an optional rotating file fallback for `-S`
//! (systemd/background) runs. Every call site still just uses `log`'s
//! macros, matching every other module in this crate; this file only picks
//! which backend receives them, the way `zcrab`'s own small logging setup
//! does for its single `env_logger` sink.

use eyre::{Result, WrapErr};
use flexi_logger::{FileSpec, Logger as FileLogger};
use log::LevelFilter;

/// Debug levels accepted by `-d`, from spec.md §6's `0|1|2|3` and
/// `none|normal|verbose|extreme` spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    None,
    Normal,
    Verbose,
    Extreme,
}

impl DebugLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "0" | "none" => Some(DebugLevel::None),
            "1" | "normal" => Some(DebugLevel::Normal),
            "2" | "verbose" => Some(DebugLevel::Verbose),
            "3" | "extreme" => Some(DebugLevel::Extreme),
            _ => None,
        }
    }

    fn filter(self) -> LevelFilter {
        match self {
            DebugLevel::None => LevelFilter::Warn,
            DebugLevel::Normal => LevelFilter::Info,
            DebugLevel::Verbose => LevelFilter::Debug,
            DebugLevel::Extreme => LevelFilter::Trace,
        }
    }
}

/// Where log records go, derived from `-S` and `-v`.
#[derive(Debug, Clone)]
pub enum Sink {
    /// `-S` absent: plain stderr, for interactive/foreground runs.
    Foreground,
    /// `-S` present: syslog's `DAEMON` facility.
    Syslog,
    /// `-S` present but syslog is unavailable: rotating log file.
    RotatingFile { directory: std::path::PathBuf },
}

/// Install the log backend for the process. Call once at startup, before
/// any other module logs.
pub fn init(sink: Sink, level: DebugLevel, verbose: bool) -> Result<()> {
    let filter = if verbose { LevelFilter::Debug.max(level.filter()) } else { level.filter() };

    match sink {
        Sink::Foreground => {
            env_logger::Builder::new().filter_level(filter).format_timestamp_millis().init();
            Ok(())
        }
        Sink::Syslog => init_syslog(filter).or_else(|e| {
            log::warn!("syslog unavailable ({e}), falling back to /var/log/zsnapd");
            init_rotating_file(std::path::Path::new("/var/log/zsnapd"), filter)
        }),
        Sink::RotatingFile { directory } => init_rotating_file(&directory, filter),
    }
}

fn init_syslog(filter: LevelFilter) -> Result<()> {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "zsnapd".to_string(),
        pid: std::process::id(),
    };
    let logger = syslog::unix(formatter).wrap_err("failed to open syslog socket")?;
    log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
        .wrap_err("failed to install syslog logger")?;
    log::set_max_level(filter);
    Ok(())
}

fn init_rotating_file(directory: &std::path::Path, filter: LevelFilter) -> Result<()> {
    FileLogger::try_with_str(filter.to_string())
        .wrap_err("failed to build rotating file logger")?
        .log_to_file(FileSpec::default().directory(directory).basename("zsnapd"))
        .rotate(
            flexi_logger::Criterion::Size(10 * 1024 * 1024),
            flexi_logger::Naming::Numbers,
            flexi_logger::Cleanup::KeepLogFiles(5),
        )
        .start()
        .wrap_err("failed to start rotating file logger")?;
    Ok(())
}

/// Log an external command at DEBUG when `log_commands` is set on the
/// dataset issuing it, the single gate point every command-running module
/// (`zfs`, `endpoint`, `engine`) goes through.
pub fn log_command(log_commands: bool, command: &str) {
    if log_commands {
        log::debug!("{command}");
    }
}

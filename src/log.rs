//! Logging.
//!
//! This module provides facilities to set up logging based on a
//! configuration via [`LogConfig`]. It is deliberately split into two
//! phases the way the teacher's logging module is: [`LogConfig::init_logging`]
//! installs a bare-bones stderr logger before the configuration file has even
//! been read (so that config-loading errors themselves can be logged), and
//! [`LogConfig::switch_logging`] replaces it with whatever the user actually
//! asked for once the configuration is known.
//!
//! Unlike the teacher, which built its own dispatch on top of `fern` plus
//! optional `syslog`/`log_reroute` machinery, this module builds directly on
//! `env_logger`, which already supports redirecting its target to a file or
//! stream and re-initializing is as simple as building a fresh `Logger` and
//! calling [`log::set_boxed_logger`]. `daemonbase::error::{Failed, ExitError}`
//! are reused verbatim rather than redefined locally.
use std::convert::TryFrom;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Args;
use daemonbase::error::{ExitError, Failed};
use log::{error, LevelFilter};
use serde::Deserialize;

//------------ LogConfig -----------------------------------------------------

/// Logging configuration, loadable from the TOML config file and
/// overridable from the command line.
#[derive(Clone, Deserialize)]
pub struct LogConfig {
    /// Where to log to?
    #[serde(default)]
    pub log_target: LogTarget,

    /// If logging to a file, use this file.
    ///
    /// This isn't part of `log_target` for deserialization reasons.
    #[serde(default)]
    pub log_file: PathBuf,

    /// The minimum log level to actually log.
    #[serde(default)]
    pub log_level: LogFilter,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_target: LogTarget::default(),
            log_file: PathBuf::new(),
            log_level: LogFilter::default(),
        }
    }
}

/// Command line arguments affecting logging, merged into [`LogConfig`]
/// after the config file has been loaded.
#[derive(Args, Clone, Debug, Default)]
pub struct LogArgs {
    /// Log more information, twice or thrice for even more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log less information, twice for no information.
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    /// Log to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub logfile: Option<String>,
}

impl LogConfig {
    /// Initializes logging.
    ///
    /// All diagnostic output is done via logging, never directly to
    /// stderr. This must run before anything else that might want to log
    /// so config-loading errors are visible. It sets a max level of `warn`
    /// and logs to stderr; [`switch_logging`](Self::switch_logging) replaces
    /// this once the real configuration is known.
    pub fn init_logging() -> Result<(), ExitError> {
        let res = env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .format_timestamp(None)
            .try_init();
        if let Err(err) = res {
            eprintln!("Failed to initialize logger: {}.\nAborting.", err);
            return Err(ExitError::default());
        }
        Ok(())
    }

    /// Updates the logging configuration from command line arguments.
    ///
    /// This should be called after the configuration file has been loaded.
    pub fn update_with_args(
        &mut self, args: &LogArgs, cur_dir: &Path,
    ) -> Result<(), Failed> {
        for _ in 0..args.verbose {
            self.log_level.increase()
        }
        for _ in 0..args.quiet {
            self.log_level.decrease()
        }
        if let Some(file) = &args.logfile {
            if file == "-" {
                self.log_target = LogTarget::Stderr;
            } else {
                self.log_target = LogTarget::File;
                self.log_file = cur_dir.join(file);
            }
        }
        Ok(())
    }

    /// Switches logging to the configured target.
    ///
    /// Once the configuration has been successfully loaded, logging should
    /// be switched to whatever the user asked for via this method.
    pub fn switch_logging(&self, daemon: bool) -> Result<(), Failed> {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.log_level.0);
        builder.filter_module("rustls", LevelFilter::Error);
        if self.log_level.0 == LevelFilter::Debug {
            builder
                .filter_module("tokio_util", LevelFilter::Info)
                .filter_module("hyper", LevelFilter::Info)
                .filter_module("h2", LevelFilter::Info);
        }
        if daemon {
            builder.format_timestamp_millis();
        } else {
            builder.format_timestamp(None);
        }
        match self.log_target {
            LogTarget::Default | LogTarget::Stderr => {
                builder.target(env_logger::Target::Stderr);
            }
            LogTarget::File => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_file)
                    .map_err(|err| {
                        error!(
                            "Failed to open log file '{}': {}",
                            self.log_file.display(), err
                        );
                        Failed
                    })?;
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
        }
        let logger = builder.build();
        log::set_max_level(self.log_level.0);
        log::set_boxed_logger(Box::new(logger)).map_err(|err| {
            error!("Failed to install logger: {}", err);
            Failed
        })
    }
}

//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub enum LogTarget {
    /// Use the system default (stderr).
    #[serde(rename = "default")]
    Default,

    /// Stderr.
    #[serde(rename = "stderr")]
    Stderr,

    /// A file.
    #[serde(rename = "file")]
    File,
}

impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Default
    }
}

//------------ LogFilter ------------------------------------------------------

#[derive(Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct LogFilter(log::LevelFilter);

impl LogFilter {
    pub fn increase(&mut self) {
        use log::LevelFilter::*;

        self.0 = match self.0 {
            Off => Error,
            Error => Warn,
            Warn => Info,
            Info => Debug,
            Debug => Trace,
            Trace => Trace,
        }
    }

    pub fn decrease(&mut self) {
        use log::LevelFilter::*;

        self.0 = match self.0 {
            Off => Off,
            Error => Off,
            Warn => Error,
            Info => Warn,
            Debug => Info,
            Trace => Debug,
        }
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        LogFilter(log::LevelFilter::Warn)
    }
}

impl TryFrom<String> for LogFilter {
    type Error = log::ParseLevelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        log::LevelFilter::from_str(&value).map(LogFilter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_increase_and_decrease_saturate() {
        let mut f = LogFilter(LevelFilter::Trace);
        f.increase();
        assert_eq!(f.0, LevelFilter::Trace);
        let mut f = LogFilter(LevelFilter::Off);
        f.decrease();
        assert_eq!(f.0, LevelFilter::Off);
    }

    #[test]
    fn filter_increase_steps_through_levels() {
        let mut f = LogFilter(LevelFilter::Warn);
        f.increase();
        assert_eq!(f.0, LevelFilter::Info);
        f.increase();
        assert_eq!(f.0, LevelFilter::Debug);
    }

    #[test]
    fn log_target_defaults_to_default_variant() {
        assert_eq!(LogTarget::default(), LogTarget::Default);
    }
}

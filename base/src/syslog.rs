// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Facilities for installing the process logger.
//!
//! Every message goes through the `log` facade; this module only decides where it ends up and
//! how it is framed. Until `syslog::init()` returns `Ok`, log macros are silently dropped.
//!
//! # Examples
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     println!("failed to initialize syslog: {}", e);
//!     return;
//! }
//! warn!("this is your {} warning", "final");
//! ```

use std::env;
use std::fmt;
use std::fmt::Display;
use std::io::Write;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;
use thiserror::Error as ThisError;

/// Environment variable that overrides the configured filter.
pub const LOG_FILTER_ENV: &str = "RUST_LOG";

macro_rules! CHRONO_TIMESTAMP_FIXED_FMT {
    () => {
        "%F %T%.6f"
    };
}

/// Errors returned by [`init`].
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// Another logger was installed before ours.
    #[error("a different logger is already installed: {0}")]
    AlreadyInstalled(log::SetLoggerError),
}

/// The priority (i.e. severity) of a log message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Priority::*;

        let string = match self {
            Error => "ERROR",
            Warning => "WARNING",
            Info => "INFO",
            Debug => "DEBUG",
            Trace => "TRACE",
        };

        write!(f, "{}", string)
    }
}

impl From<log::Level> for Priority {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Priority::Error,
            log::Level::Warn => Priority::Warning,
            log::Level::Info => Priority::Info,
            log::Level::Debug => Priority::Debug,
            log::Level::Trace => Priority::Trace,
        }
    }
}

impl From<Priority> for log::LevelFilter {
    fn from(pri: Priority) -> Self {
        match pri {
            Priority::Error => log::LevelFilter::Error,
            Priority::Warning => log::LevelFilter::Warn,
            Priority::Info => log::LevelFilter::Info,
            Priority::Debug => log::LevelFilter::Debug,
            Priority::Trace => log::LevelFilter::Trace,
        }
    }
}

impl TryFrom<&str> for Priority {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        match value.to_uppercase().as_str() {
            "ERROR" => Ok(Priority::Error),
            "WARN" | "WARNING" => Ok(Priority::Warning),
            "INFO" => Ok(Priority::Info),
            "DEBUG" => Ok(Priority::Debug),
            "TRACE" => Ok(Priority::Trace),
            _ => Err("Priority can only be parsed from error, warning, info, debug or trace"),
        }
    }
}

static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Installs the logger at `Priority::Info`.
pub fn init() -> Result<(), Error> {
    init_with_priority(Priority::Info)
}

/// Installs the logger, showing messages at `priority` and above.
///
/// A filter in the `RUST_LOG` environment variable takes precedence over `priority`. Calling this
/// again after a successful install is a no-op.
pub fn init_with_priority(priority: Priority) -> Result<(), Error> {
    let mut installed = INSTALLED.lock();
    if *installed {
        return Ok(());
    }

    let mut builder = env_logger::Builder::new();
    builder.filter_level(priority.into());
    if let Ok(filters) = env::var(LOG_FILTER_ENV) {
        builder.parse_filters(&filters);
    }
    builder.target(env_logger::Target::Stderr);
    builder.format(|buf, record| {
        let pri: Priority = record.level().into();
        write!(
            buf,
            "[{}:{}",
            chrono::Local::now().format(CHRONO_TIMESTAMP_FIXED_FMT!()),
            pri
        )?;
        if let Some(path) = record.file() {
            write!(buf, ":{}", path)?;
            if let Some(line) = record.line() {
                write!(buf, ":{}", line)?;
            }
        }
        writeln!(buf, "] {}", record.args())
    });
    builder.try_init().map_err(Error::AlreadyInstalled)?;
    *installed = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_level_names() {
        assert_eq!(Priority::try_from("warn"), Ok(Priority::Warning));
        assert_eq!(Priority::try_from("DEBUG"), Ok(Priority::Debug));
        assert!(Priority::try_from("loud").is_err());
    }

    #[test]
    fn priority_deserializes_lowercase() {
        let pri: Priority = serde_json::from_str("\"trace\"").unwrap();
        assert_eq!(pri, Priority::Trace);
        assert_eq!(
            log::LevelFilter::from(Priority::Warning),
            log::LevelFilter::Warn
        );
    }

    #[test]
    fn init_twice_is_ok() {
        init().unwrap();
        init_with_priority(Priority::Debug).unwrap();
    }
}

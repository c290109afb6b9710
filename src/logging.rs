//! Job-scoped logging with secret masking.
//!
//! Every resolved token is registered as a mask; any line that passes
//! through the [`Logger`] has each mask occurrence replaced with a `*`-run
//! of equal length before it reaches the terminal or the captured log
//! buffer. The captured buffer is what post-steps see through a `log`
//! volume.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, RwLock};

/// Log verbosity for job-visible output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A message buffer whose rendered form has all registered masks applied.
#[derive(Debug, Default)]
pub struct MaskedMessage {
    msg: Mutex<String>,
    masks: RwLock<Vec<String>>,
}

impl MaskedMessage {
    pub fn new(msg: impl Into<String>, masks: Vec<String>) -> Self {
        Self {
            msg: Mutex::new(msg.into()),
            masks: RwLock::new(masks),
        }
    }

    /// Append raw (unmasked) content to the buffer.
    pub fn add_message(&self, msg: &str) {
        self.msg.lock().expect("masked message poisoned").push_str(msg);
    }

    /// Register a new mask. Masks apply to everything rendered afterwards,
    /// including content appended before the mask was known.
    pub fn add_mask(&self, mask: impl Into<String>) {
        let mask = mask.into();
        if mask.is_empty() {
            return;
        }
        self.masks.write().expect("mask registry poisoned").push(mask);
    }

    /// Apply the current mask set to an arbitrary string.
    pub fn filter(&self, msg: &str) -> String {
        let masks = self.masks.read().expect("mask registry poisoned");
        Self::mask(msg, &masks)
    }

    fn mask(msg: &str, masks: &[String]) -> String {
        let mut masked = msg.to_string();
        for mask in masks {
            let replacement = "*".repeat(mask.len());
            masked = masked.replace(mask.as_str(), &replacement);
        }
        masked
    }

    /// Render the whole buffer with masks applied.
    pub fn render(&self) -> String {
        let msg = self.msg.lock().expect("masked message poisoned");
        let masks = self.masks.read().expect("mask registry poisoned");
        Self::mask(&msg, &masks)
    }
}

/// Job logger. Owned by the runner, shared by reference with every
/// component that emits job-visible output.
pub struct Logger {
    level: LogLevel,
    captured: MaskedMessage,
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            captured: MaskedMessage::default(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Register a secret value so it can never appear in any log line.
    pub fn add_mask(&self, mask: impl Into<String>) {
        self.captured.add_mask(mask);
    }

    /// Apply the mask set to an arbitrary string (used for error text that
    /// bypasses the logger on its way to the user).
    pub fn filter(&self, msg: &str) -> String {
        self.captured.filter(msg)
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Debug, msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Warn, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Error, msg.as_ref());
    }

    fn log(&self, level: LogLevel, msg: &str) {
        if level < self.level {
            return;
        }
        let masked = self.captured.filter(msg);
        match level {
            LogLevel::Debug => tracing::debug!("{}", masked),
            LogLevel::Info => tracing::info!("{}", masked),
            LogLevel::Warn => tracing::warn!("{}", masked),
            LogLevel::Error => tracing::error!("{}", masked),
        }
        self.captured.add_message(msg);
        self.captured.add_message("\n");
    }

    /// Container output is captured verbatim (subject to masking) without a
    /// level prefix, so the `log` volume reflects what the containers wrote.
    pub fn container_output(&self, container: &str, out: &str) {
        for line in out.lines() {
            self.log(LogLevel::Info, &format!("[{}] {}", container, line));
        }
    }

    /// Render everything logged so far, masks applied.
    pub fn captured(&self) -> String {
        self.captured.render()
    }
}

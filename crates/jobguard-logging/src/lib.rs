//! jobguard-logging
//!
//! Leveled structured output, gated by the `logging.{enabled,level,prefix}`
//! config keys (spec.md §6). `tracing` itself is process-global and can't
//! honor a per-coordinator-instance `enabled`/`level` toggle, so callers
//! route every log line through a `Logger` value instead of calling
//! `tracing::info!` etc. directly — the gate lives here, not at the
//! subscriber.

use serde::{Deserialize, Serialize};
use tracing::Level;

/// `logging.{enabled,level,prefix}` — see spec.md §6 for defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: LogLevel,
    pub prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
            prefix: "[JobGuard]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_tracing(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// The logger every component holds. Cheap to clone (two small `String`s
/// and a couple of `Copy` fields).
#[derive(Debug, Clone)]
pub struct Logger {
    enabled: bool,
    level: Level,
    prefix: String,
}

impl Logger {
    pub fn new(cfg: &LoggingConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            level: cfg.level.as_tracing(),
            prefix: cfg.prefix.clone(),
        }
    }

    fn permits(&self, candidate: Level) -> bool {
        self.enabled && candidate <= self.level
    }

    pub fn error(&self, msg: &str) {
        if self.permits(Level::ERROR) {
            tracing::error!(prefix = %self.prefix, "{msg}");
        }
    }

    pub fn warn(&self, msg: &str) {
        if self.permits(Level::WARN) {
            tracing::warn!(prefix = %self.prefix, "{msg}");
        }
    }

    pub fn info(&self, msg: &str) {
        if self.permits(Level::INFO) {
            tracing::info!(prefix = %self.prefix, "{msg}");
        }
    }

    pub fn debug(&self, msg: &str) {
        if self.permits(Level::DEBUG) {
            tracing::debug!(prefix = %self.prefix, "{msg}");
        }
    }
}

/// Install a process-global `tracing` subscriber honoring `RUST_LOG`,
/// falling back to `info`. For hosting processes that have not already set
/// up their own subscriber. Idempotent-ish: a second call is harmless but
/// wasted since `tracing`'s global default can only be set once per
/// process; callers that manage their own subscriber should skip this.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_logger_permits_nothing() {
        let logger = Logger::new(&LoggingConfig {
            enabled: false,
            level: LogLevel::Trace,
            prefix: "[x]".into(),
        });
        assert!(!logger.permits(Level::ERROR));
    }

    #[test]
    fn info_level_excludes_debug() {
        let logger = Logger::new(&LoggingConfig {
            enabled: true,
            level: LogLevel::Info,
            prefix: "[x]".into(),
        });
        assert!(logger.permits(Level::INFO));
        assert!(!logger.permits(Level::DEBUG));
    }

    #[test]
    fn default_matches_spec_table() {
        let cfg = LoggingConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.level, LogLevel::Info);
        assert_eq!(cfg.prefix, "[JobGuard]");
    }
}

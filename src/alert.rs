//! Operator alerts.
//!
//! Delivery (chat, paging) belongs to the embedding process. The engine only
//! calls [`Alerter::alert`]; the default [`TracingAlerter`] emits a structured
//! event on the `mirror_sync::alert` target so a subscriber layer can route it.

use std::fmt;

/// Severity of an operator alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives operator alerts. Must not block.
pub trait Alerter: Send + Sync + 'static {
    fn alert(&self, level: AlertLevel, message: &str);
}

/// Alerts as `tracing` events plus an alert counter.
#[derive(Debug, Clone, Default)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Info => tracing::info!(target: "mirror_sync::alert", level = %level, "{}", message),
            AlertLevel::Warning => tracing::warn!(target: "mirror_sync::alert", level = %level, "{}", message),
            AlertLevel::Error => tracing::error!(target: "mirror_sync::alert", level = %level, "{}", message),
        }
        crate::metrics::record_alert(level.as_str());
    }
}

//! Non-fatal diagnostics channel.
//!
//! Cleanup paths (network-rule removal, forced service teardown, system
//! proxy reset) are best-effort: their failures must never fail the caller.
//! Instead of discarding those errors they are logged at WARN and, when a
//! receiver is attached, forwarded over an unbounded channel so a front end
//! or test can inspect them.
//!
//! ```rust
//! use rostovvpn_rs::diagnostics::Diagnostics;
//!
//! let (diag, mut rx) = Diagnostics::channel();
//! diag.report("netrules", "nft delete table: no such table");
//! let item = rx.try_recv().unwrap();
//! assert_eq!(item.source, "netrules");
//! ```

use tokio::sync::mpsc;
use tracing::warn;

/// One swallowed error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Component that produced the error.
    pub source: &'static str,
    /// Human-readable error text.
    pub message: String,
}

/// Receiving end of a diagnostics channel.
pub type DiagnosticsReceiver = mpsc::UnboundedReceiver<Diagnostic>;

/// Cloneable sink for non-fatal errors.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    tx: Option<mpsc::UnboundedSender<Diagnostic>>,
}

impl Diagnostics {
    /// A sink that only logs.
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    /// A sink that logs and forwards to the returned receiver.
    pub fn channel() -> (Self, DiagnosticsReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Records a swallowed error.
    pub fn report(&self, source: &'static str, message: impl Into<String>) {
        let message = message.into();
        warn!(source, "{}", message);
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening.
            let _ = tx.send(Diagnostic { source, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_only_does_not_panic() {
        Diagnostics::log_only().report("test", "ignored");
    }

    #[test]
    fn test_dropped_receiver_is_tolerated() {
        let (diag, rx) = Diagnostics::channel();
        drop(rx);
        diag.report("test", "nobody listens");
    }

    #[test]
    fn test_channel_preserves_order() {
        let (diag, mut rx) = Diagnostics::channel();
        diag.report("a", "first");
        diag.clone().report("b", "second");
        assert_eq!(rx.try_recv().unwrap().message, "first");
        assert_eq!(rx.try_recv().unwrap().source, "b");
        assert!(rx.try_recv().is_err());
    }
}

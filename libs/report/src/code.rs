//! Combinable error codes for setup operations.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Outcome of a fallible setup operation, as a set of independent flags.
///
/// The outcome axis (`RETRYABLE`, `FATAL`), the severity axis (`WARN`,
/// `ALERT`) and the batch-control axis (`ABORT`) are orthogonal: an
/// operation may proceed in a degraded mode and still want an alert
/// displayed, or fail fatally in a way that makes attempting its siblings
/// pointless. Codes from independent operations combine with `|`; combining
/// never drops a flag that was already set.
///
/// A code is `NONE` exactly when no flag is set, meaning the operation
/// succeeded and produced no message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Success; nothing to report.
    pub const NONE: ErrorCode = ErrorCode(0);

    /// The failure may vanish on retry (port in use, transient resource
    /// pressure). Retrying the identical operation later is safe.
    pub const RETRYABLE: ErrorCode = ErrorCode(1 << 0);

    /// The failure will not change on retry; configuration or environment
    /// must be fixed first.
    pub const FATAL: ErrorCode = ErrorCode(1 << 1);

    /// Stop attempting further independent operations in the same batch.
    pub const ABORT: ErrorCode = ErrorCode(1 << 2);

    /// A message is present and should be displayed as a warning.
    pub const WARN: ErrorCode = ErrorCode(1 << 3);

    /// A message is present and should be displayed as an alert.
    pub const ALERT: ErrorCode = ErrorCode(1 << 4);

    /// True when no flag is set.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True when every flag in `other` is set in `self`.
    pub fn contains(self, other: ErrorCode) -> bool {
        self.0 & other.0 == other.0
    }

    /// The display level a message accompanying this code should use.
    pub fn severity(self) -> Severity {
        if self.contains(ErrorCode::ALERT) {
            Severity::Alert
        } else if self.contains(ErrorCode::WARN) {
            Severity::Warning
        } else {
            Severity::Quiet
        }
    }
}

impl BitOr for ErrorCode {
    type Output = ErrorCode;

    fn bitor(self, rhs: ErrorCode) -> ErrorCode {
        ErrorCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorCode {
    fn bitor_assign(&mut self, rhs: ErrorCode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let names = [
            (ErrorCode::RETRYABLE, "retryable"),
            (ErrorCode::FATAL, "fatal"),
            (ErrorCode::ABORT, "abort"),
            (ErrorCode::WARN, "warn"),
            (ErrorCode::ALERT, "alert"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Display level for a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// No message level requested.
    Quiet,
    /// Surface the message, but the operation proceeded.
    Warning,
    /// Surface the message prominently.
    Alert,
}

//! Error-reporting protocol shared by the bind path and the config loader.
//!
//! Fallible setup operations (listener binding, socket option configuration,
//! directive parsing) report through two cooperating pieces:
//!
//! - [`ErrorCode`]: a flag set combining an outcome class (retryable/fatal)
//!   with a severity (warn/alert) and a batch-control signal (abort).
//!   Callers running several independent operations OR the codes together;
//!   severity and control bits survive the combination.
//! - [`DiagBuf`]: a bounded buffer for the single human-readable message an
//!   operation may produce alongside its code. A zero-capacity buffer
//!   discards messages, which is a supported "don't care" mode.

mod code;
mod diag;

pub use code::{ErrorCode, Severity};
pub use diag::DiagBuf;

//! Frontend sections and the `tcp-request` directive surface.
//!
//! The configuration loader tokenizes directives elsewhere and hands each
//! `tcp-request` line here as a slice of tokens. Outcomes are tri-state:
//! applied, ignored with a warning (the loader proceeds), or invalid (the
//! configuration is rejected). Diagnostics go into the caller's [`DiagBuf`]
//! so the loader controls where, and whether, messages surface.

use std::sync::Arc;
use std::time::Duration;

use edge_report::DiagBuf;
use thiserror::Error;

use crate::proxy::{Action, CmpOp, Condition, InspectionConfig, Polarity, ReqLenCmp, TcpRule};

/// Capabilities of the enclosing proxy section.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyCaps {
    /// Section accepts client connections (as opposed to pure backends).
    pub frontend: bool,
}

/// One proxy section under construction by the configuration loader.
pub struct ProxySection {
    pub id: String,
    /// True for a `defaults` section, which cannot carry tcp-request rules.
    pub defaults: bool,
    pub caps: ProxyCaps,
    pub inspect_delay: Option<Duration>,
    pub rules: Vec<TcpRule>,
}

impl ProxySection {
    /// A frontend section.
    pub fn frontend(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            defaults: false,
            caps: ProxyCaps { frontend: true },
            inspect_delay: None,
            rules: Vec::new(),
        }
    }

    /// A `defaults` section.
    pub fn defaults(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            defaults: true,
            caps: ProxyCaps::default(),
            inspect_delay: None,
            rules: Vec::new(),
        }
    }

    /// A backend-only section (no frontend capability).
    pub fn backend(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            defaults: false,
            caps: ProxyCaps { frontend: false },
            inspect_delay: None,
            rules: Vec::new(),
        }
    }

    /// Inspection settings derived from this section.
    pub fn inspection(&self) -> InspectionConfig {
        InspectionConfig {
            delay: self.inspect_delay,
            ..Default::default()
        }
    }
}

/// Outcome of handling one directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ParseOutcome {
    /// Directive applied.
    Applied,
    /// Directive ignored; a warning message explains why.
    Ignored,
    /// Configuration is invalid; loading must fail.
    Invalid,
}

/// Condition compile error reported by the external compiler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CondError(pub String);

/// Compiles guard-condition tokens into an evaluable condition.
///
/// The real compiler lives in the ACL subsystem; this crate ships
/// [`ReqLenConds`] covering the request-length vocabulary.
pub trait CondParser {
    fn compile(&self, tokens: &[&str]) -> Result<Arc<dyn Condition>, CondError>;
}

/// Compiler for `req_len {ge|lt} <n>` condition expressions.
pub struct ReqLenConds;

impl CondParser for ReqLenConds {
    fn compile(&self, tokens: &[&str]) -> Result<Arc<dyn Condition>, CondError> {
        match tokens {
            ["req_len", op, n] => {
                let op = match *op {
                    "ge" => CmpOp::Ge,
                    "lt" => CmpOp::Lt,
                    other => {
                        return Err(CondError(format!(
                            "unknown req_len operator '{other}' (expected 'ge' or 'lt')"
                        )))
                    }
                };
                let n: u64 = n
                    .parse()
                    .map_err(|_| CondError(format!("invalid req_len bound '{n}'")))?;
                Ok(Arc::new(ReqLenCmp { op, n }))
            }
            [] => Err(CondError("empty condition".to_string())),
            other => Err(CondError(format!(
                "unknown condition '{}'",
                other.join(" ")
            ))),
        }
    }
}

/// Handle a `tcp-request` directive.
///
/// `args[0]` is the directive keyword itself; sub-keywords follow. The two
/// accepted forms are `tcp-request inspect-delay <time>` and
/// `tcp-request content {accept|reject} [{if|unless} <condition>...]`.
pub fn parse_tcp_request(
    args: &[&str],
    px: &mut ProxySection,
    conds: &dyn CondParser,
    diag: &mut DiagBuf,
) -> ParseOutcome {
    diag.clear();

    let Some(&sub) = args.get(1) else {
        diag.set(&format!(
            "missing argument for 'tcp-request' in proxy '{}'",
            px.id
        ));
        return ParseOutcome::Invalid;
    };

    match sub {
        "inspect-delay" => parse_inspect_delay(args, px, diag),
        "content" => parse_content(args, px, conds, diag),
        other => {
            diag.set(&format!(
                "unknown argument '{}' after 'tcp-request' in proxy '{}'",
                other, px.id
            ));
            ParseOutcome::Invalid
        }
    }
}

fn parse_inspect_delay(args: &[&str], px: &mut ProxySection, diag: &mut DiagBuf) -> ParseOutcome {
    if px.defaults {
        diag.set("tcp-request inspect-delay is not allowed in 'defaults' sections");
        return ParseOutcome::Invalid;
    }

    if !px.caps.frontend {
        diag.set(&format!(
            "tcp-request inspect-delay will be ignored because proxy '{}' has no frontend capability",
            px.id
        ));
        return ParseOutcome::Ignored;
    }

    let delay = match args.get(2).map(|s| parse_time(s)) {
        Some(Ok(delay)) => delay,
        Some(Err(TimeParseError::UnexpectedChar(c))) => {
            diag.set(&format!(
                "'tcp-request inspect-delay' expects a positive delay in milliseconds, in proxy '{}' (unexpected character '{}')",
                px.id, c
            ));
            return ParseOutcome::Invalid;
        }
        Some(Err(TimeParseError::Empty)) | None => {
            diag.set(&format!(
                "'tcp-request inspect-delay' expects a positive delay in milliseconds, in proxy '{}'",
                px.id
            ));
            return ParseOutcome::Invalid;
        }
    };

    if px.inspect_delay.is_some() {
        diag.set(&format!(
            "ignoring tcp-request inspect-delay (was already defined) in proxy '{}'",
            px.id
        ));
        return ParseOutcome::Ignored;
    }

    px.inspect_delay = Some(delay);
    ParseOutcome::Applied
}

fn parse_content(
    args: &[&str],
    px: &mut ProxySection,
    conds: &dyn CondParser,
    diag: &mut DiagBuf,
) -> ParseOutcome {
    if px.defaults {
        diag.set("tcp-request content is not allowed in 'defaults' sections");
        return ParseOutcome::Invalid;
    }

    let action = match args.get(2) {
        Some(&"accept") => Action::Accept,
        Some(&"reject") => Action::Reject,
        other => {
            diag.set(&format!(
                "'tcp-request content' expects 'accept' or 'reject', in proxy '{}' (was '{}')",
                px.id,
                other.unwrap_or(&"")
            ));
            return ParseOutcome::Invalid;
        }
    };

    let rule = match args.get(3) {
        None => TcpRule::unconditional(action),
        Some(&(combinator @ ("if" | "unless"))) => {
            let polarity = if combinator == "if" {
                Polarity::If
            } else {
                Polarity::Unless
            };
            match conds.compile(&args[4..]) {
                Ok(cond) => TcpRule::guarded(action, cond, polarity),
                Err(e) => {
                    diag.set(&format!(
                        "error detected in proxy '{}' while parsing '{}' condition: {}",
                        px.id, combinator, e
                    ));
                    return ParseOutcome::Invalid;
                }
            }
        }
        Some(other) => {
            diag.set(&format!(
                "'tcp-request content' expects 'if' or 'unless' after the action, in proxy '{}' (was '{}')",
                px.id, other
            ));
            return ParseOutcome::Invalid;
        }
    };

    px.rules.push(rule);
    ParseOutcome::Applied
}

/// Duration syntax error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("empty duration")]
    Empty,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
}

/// Parse a duration with an optional unit suffix.
///
/// Accepted units are `us`, `ms`, `s`, `m`, `h` and `d`; a bare number is
/// milliseconds. The error carries the first character that broke the
/// syntax so the loader can point at it.
pub fn parse_time(s: &str) -> Result<Duration, TimeParseError> {
    if s.is_empty() {
        return Err(TimeParseError::Empty);
    }

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        let c = s.chars().next().unwrap_or('?');
        return Err(TimeParseError::UnexpectedChar(c));
    }

    let value: u64 = s[..digits_end]
        .parse()
        .map_err(|_| TimeParseError::UnexpectedChar(s.chars().next().unwrap_or('?')))?;

    match &s[digits_end..] {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "us" => Ok(Duration::from_micros(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86400)),
        suffix => {
            let c = suffix.chars().next().unwrap_or('?');
            Err(TimeParseError::UnexpectedChar(c))
        }
    }
}

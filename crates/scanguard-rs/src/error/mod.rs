use std::{fmt, time::Duration};

use ipnet::IpNet;

use crate::models::{ScanId, ScanStatus};

/// Rejections raised before any process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid target format `{target}`: {reason}")]
    InvalidFormat { target: String, reason: String },
    #[error("target {target} overlaps forbidden range {range}")]
    ForbiddenRange { target: String, range: IpNet },
    #[error("network too large: {target} covers {count} addresses (max {max})")]
    RangeTooLarge { target: String, count: u128, max: u128 },
    #[error("target {target} is outside the configured scope")]
    OutOfScope { target: String },
    #[error("unknown scan profile `{0}`")]
    UnknownProfile(String),
    #[error("forbidden argument pattern detected ({rule}): {pattern}")]
    ForbiddenPattern {
        rule: &'static str,
        pattern: &'static str,
    },
    #[error("custom profile requires arguments")]
    MissingArguments,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("scan timeout after {:.1}s (limit {}s)", .elapsed.as_secs_f64(), .limit.as_secs())]
    Timeout { elapsed: Duration, limit: Duration },
    #[error("tool exited with {}: {stderr}", exit_label(.code))]
    ToolFailure { code: Option<i32>, stderr: String },
    #[error("tool `{path}` unavailable: {reason}")]
    ToolUnavailable { path: String, reason: String },
    #[error("scan cancelled after {:.1}s", .elapsed.as_secs_f64())]
    Cancelled { elapsed: Duration },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (signal)".to_string(),
    }
}

/// Location of a syntax error inside the tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextPosition {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl TextPosition {
    pub fn locate(text: &str, offset: usize) -> Self {
        let offset = offset.min(text.len());
        let before = &text.as_bytes()[..offset];
        let line = before.iter().filter(|b| **b == b'\n').count() + 1;
        let column = match before.iter().rposition(|b| *b == b'\n') {
            Some(nl) => offset - nl,
            None => offset + 1,
        };
        Self {
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for TextPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}, column {} (byte {})",
            self.line, self.column, self.offset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed tool output at {position}: {message}")]
    MalformedOutput {
        message: String,
        position: TextPosition,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Execution,
    Parse,
}

/// Any failure of the scan pipeline, tagged by category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
}

impl ScanError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScanError::Validation(_) => ErrorCategory::Validation,
            ScanError::Execution(_) => ErrorCategory::Execution,
            ScanError::Parse(_) => ErrorCategory::Parse,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to encode parsed result: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stored scan {id} is corrupt: {reason}")]
    Corrupt { id: ScanId, reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
    #[error("job queue is full")]
    Full,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("scan {0} not found")]
    NotFound(ScanId),
    #[error("scan {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ScanId,
        from: ScanStatus,
        to: ScanStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to queue scan: {0}")]
    Queue(#[from] QueueError),
}

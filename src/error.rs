use std::fmt::Write as _;
use std::panic::Location;
use std::{fmt, sync::Arc};

use strum::{AsRefStr, Display};

/// Where a failure originated. Callers branch on this, not on `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Pipeline construction failed (model or processor phase).
    Initialization,
    /// Fetching, decoding or inference failed for one task.
    Task,
    /// The execution unit itself died outside the message protocol.
    UnitFault,
    /// Raised for every outstanding task on `terminate()`.
    PoolTerminated,
    /// Invalid configuration.
    Config,
}

#[derive(Debug, Clone)]
pub enum Cause {
    Any(PoolError),
    Std(Arc<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone)]
pub struct PoolError {
    pub kind: ErrorKind,
    pub key: &'static str,
    pub causes: Vec<Cause>,
    pub file: &'static str,
    pub line: u32,
}

impl PoolError {
    /// Task-scoped error at the caller's location.
    #[track_caller]
    #[inline]
    pub fn new(key: &'static str) -> Self {
        Self::with_kind(ErrorKind::Task, key)
    }

    #[track_caller]
    #[inline]
    pub fn with_kind(kind: ErrorKind, key: &'static str) -> Self {
        let loc = Location::caller();
        Self {
            kind,
            key,
            causes: Vec::new(),
            file: loc.file(),
            line: loc.line(),
        }
    }

    #[track_caller]
    pub fn terminated() -> Self {
        Self::with_kind(ErrorKind::PoolTerminated, "pool_terminated")
    }

    #[track_caller]
    pub fn unit_fault(ordinal: usize) -> Self {
        Self::with_kind(ErrorKind::UnitFault, "unit_fault")
            .push_str(format!("worker {} crashed while processing the task", ordinal))
    }

    /// Re-tag an error, keeping location and causes.
    #[inline]
    pub fn of_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    #[inline]
    pub fn push_any(mut self, cause: PoolError) -> Self {
        self.causes.push(Cause::Any(cause));
        self
    }

    #[inline]
    pub fn push_str(mut self, message: impl Into<String>) -> Self {
        self.causes.push(Cause::Std(Arc::new(std::io::Error::other(
            message.into(),
        ))));
        self
    }

    #[inline]
    pub fn push_std(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.causes.push(Cause::Std(Arc::new(cause)));
        self
    }

    pub fn is_terminated(&self) -> bool {
        self.kind == ErrorKind::PoolTerminated
    }

    /// Human readable message: the key followed by the leaf causes.
    pub fn message(&self) -> String {
        let mut out = self.key.to_string();
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        if !leaves.is_empty() {
            out.push_str(": ");
            out.push_str(&leaves.join("; "));
        }
        out
    }

    fn collect_leaves(&self, out: &mut Vec<String>) {
        for cause in &self.causes {
            match cause {
                Cause::Any(e) if e.causes.is_empty() => out.push(e.key.to_string()),
                Cause::Any(e) => e.collect_leaves(out),
                Cause::Std(e) => out.push(e.to_string()),
            }
        }
    }

    /// ASCII tree of causes.
    pub fn render_tree(&self) -> String {
        let mut out = format!("{}:{} - {} ({})", self.file, self.line, self.key, self.kind);
        self.render_causes(&mut out, "");
        out
    }

    fn render_causes(&self, out: &mut String, prefix: &str) {
        for (i, cause) in self.causes.iter().enumerate() {
            let is_last = i == self.causes.len() - 1;
            let branch = if is_last { "└── " } else { "├── " };
            let extension = if is_last { "    " } else { "│   " };

            match cause {
                Cause::Any(e) => {
                    let _ = write!(out, "\n{}{}[{}:{}] {}", prefix, branch, e.file, e.line, e.key);
                    e.render_causes(out, &format!("{}{}", prefix, extension));
                }
                Cause::Std(e) => {
                    let _ = write!(out, "\n{}{}{}", prefix, branch, e);

                    let mut source = e.source();
                    let mut depth = 0;
                    while let Some(err) = source {
                        let _ = write!(out, "\n{}{}{}↳ {}", prefix, extension, "  ".repeat(depth), err);
                        source = err.source();
                        depth += 1;
                    }
                }
            }
        }
    }

    pub fn log_tree(&self) {
        tracing::error!(kind = %self.kind, "{}", self.render_tree());
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] {}", self.file, self.line, self.message())
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes.iter().find_map(|c| match c {
            Cause::Any(e) => Some(e as &dyn std::error::Error),
            Cause::Std(e) => Some(e.as_ref() as &(dyn std::error::Error + 'static)),
        })
    }
}

impl From<reqwest::Error> for PoolError {
    #[track_caller]
    fn from(e: reqwest::Error) -> Self {
        PoolError::new("reqwest").push_std(e)
    }
}

impl From<serde_json::Error> for PoolError {
    #[track_caller]
    fn from(e: serde_json::Error) -> Self {
        PoolError::new("serde_json").push_std(e)
    }
}

impl From<image::ImageError> for PoolError {
    #[track_caller]
    fn from(e: image::ImageError) -> Self {
        PoolError::new("image").push_std(e)
    }
}

impl From<url::ParseError> for PoolError {
    #[track_caller]
    fn from(e: url::ParseError) -> Self {
        PoolError::new("url_parse").push_std(e)
    }
}

impl From<base64::DecodeError> for PoolError {
    #[track_caller]
    fn from(e: base64::DecodeError) -> Self {
        PoolError::new("base64_decode").push_std(e)
    }
}

impl From<std::io::Error> for PoolError {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        PoolError::new("io_error").push_std(e)
    }
}

impl From<zip::result::ZipError> for PoolError {
    #[track_caller]
    fn from(e: zip::result::ZipError) -> Self {
        PoolError::new("zip").push_std(e)
    }
}

impl From<tokio::task::JoinError> for PoolError {
    #[track_caller]
    fn from(e: tokio::task::JoinError) -> Self {
        PoolError::new("join_error").push_std(e)
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_lists_leaf_causes() {
        let err = PoolError::with_kind(ErrorKind::Initialization, "model_load_failed")
            .push_any(PoolError::new("download").push_str("connection reset"))
            .push_str("giving up");

        assert_eq!(err.kind, ErrorKind::Initialization);
        assert_eq!(err.message(), "model_load_failed: connection reset; giving up");
    }

    #[test]
    fn tree_has_one_line_per_cause() {
        let err = PoolError::new("inference_failed")
            .push_any(PoolError::new("tensor_shape"))
            .push_str("bad input");

        let tree = err.render_tree();
        assert_eq!(tree.lines().count(), 3);
        assert!(tree.contains("├── "));
        assert!(tree.contains("└── bad input"));
    }

    #[test]
    fn terminated_is_tagged() {
        let err = PoolError::terminated();
        assert!(err.is_terminated());
        assert_eq!(err.kind.as_ref(), "pool_terminated");
    }
}

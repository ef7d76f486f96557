//! Portable failure records carried in failure responses.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// Category of a failed render request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Request bytes were malformed or truncated.
    ProtocolDecode,
    /// The embedded texture was not a valid PNG.
    ImageDecode,
    /// The renderer failed on a valid job.
    Render,
    /// The target worker queue was full.
    QueueFull,
    /// The target worker loop is no longer running.
    WorkerStopped,
    /// The result could not be encoded for the wire.
    Encode,
}

impl FailureKind {
    /// Wire name of the kind, as written into failure responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ProtocolDecode => "ProtocolDecodeError",
            FailureKind::ImageDecode => "ImageDecodeError",
            FailureKind::Render => "RenderError",
            FailureKind::QueueFull => "QueueFullError",
            FailureKind::WorkerStopped => "WorkerStoppedError",
            FailureKind::Encode => "EncodeError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error record sent back to the requester.
///
/// `kind` is one of the [`FailureKind`] names. `stack_frames` holds the
/// error's `source()` chain, outermost cause first, as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub stack_frames: Vec<String>,
}

impl ErrorRecord {
    /// Creates a record without stack frames.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            message: message.into(),
            stack_frames: Vec::new(),
        }
    }

    /// Builds a record from an error and walks its source chain.
    pub fn from_error(kind: FailureKind, err: &(dyn StdError + 'static)) -> Self {
        let mut stack_frames = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack_frames.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: kind.as_str().to_string(),
            message: err.to_string(),
            stack_frames,
        }
    }

    /// True when the record's kind name matches `kind`.
    pub fn is_kind(&self, kind: FailureKind) -> bool {
        self.kind == kind.as_str()
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct Inner;

    #[test]
    fn test_from_error_collects_source_chain() {
        let record = ErrorRecord::from_error(FailureKind::Render, &Outer(Inner));

        assert_eq!(record.kind, "RenderError");
        assert_eq!(record.message, "outer failure");
        assert_eq!(record.stack_frames, vec!["inner failure".to_string()]);
        assert!(record.is_kind(FailureKind::Render));
    }

    #[test]
    fn test_new_has_no_frames() {
        let record = ErrorRecord::new(FailureKind::QueueFull, "queue full");
        assert!(record.stack_frames.is_empty());
        assert_eq!(record.to_string(), "QueueFullError: queue full");
    }
}

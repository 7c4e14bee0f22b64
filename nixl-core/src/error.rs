use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of polling an in-flight transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferStatus {
    /// Sub-operations are still outstanding.
    InProgress,
    /// Every sub-operation completed successfully.
    Done,
}

impl XferStatus {
    pub fn is_done(self) -> bool {
        matches!(self, XferStatus::Done)
    }
}

/// Failure kinds propagated through every engine operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        EngineError::NotSupported(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        EngineError::Backend(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = EngineError::not_found("remote agent \"peer\"");
        assert!(err.to_string().contains("peer"));

        let err = EngineError::invalid("descriptor count mismatch");
        assert!(err.to_string().starts_with("invalid argument"));
    }

    #[test]
    fn status_done_check() {
        assert!(XferStatus::Done.is_done());
        assert!(!XferStatus::InProgress.is_done());
    }
}

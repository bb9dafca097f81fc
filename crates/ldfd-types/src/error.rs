//! The error taxonomy surfaced across the core.

use thiserror::Error;

/// Recovery policy, attached to each variant's doc comment: recover
/// locally only when explicitly retryable; user-surface errors are never
/// auto-retried.
#[derive(Debug, Error)]
pub enum LdfdError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Network/5xx from a forge or mirror. Retry with backoff.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A forge returned something unparseable. Fails the sync for operator
    /// investigation; not retried.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Downloaded blob didn't match its declared checksum. Fails the
    /// download and invalidates the cache entry; not retried.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Container runtime or image unavailable for the target arch. Fails
    /// the build early.
    #[error("build environment invalid: {0}")]
    EnvironmentInvalid(String),

    /// A build stage exited non-zero. Fails the build; retry permitted.
    #[error("stage {stage} failed: {reason}")]
    StageFailed { stage: String, reason: String },

    /// Cooperative cancellation observed. Terminal, no retry.
    #[error("cancelled")]
    Cancelled,

    /// `retry_count >= max_retries`. Terminal.
    #[error("retry exhausted")]
    RetryExhausted,

    /// A sync is already running for this source (invariant 2).
    #[error("sync already in progress for source {0}")]
    SyncInProgress(String),

    /// No enabled source exposes this component for this owner.
    #[error("no source provides component {0}")]
    NoSourceForComponent(String),

    /// The requested/default version has no matching `SourceVersion` row.
    #[error("version not available for component {component}: {version}")]
    VersionNotAvailable { component: String, version: String },

    /// A `{placeholder}` in a URL template had no substitution value.
    #[error("template unresolvable: missing substitution for {0}")]
    TemplateUnresolvable(String),

    /// Unexpected invariant violation. Logged with context, surfaced
    /// generically.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LdfdError {
    /// Whether the operation that produced this error should be retried
    /// by the caller's retry loop (download jobs, version sync).
    pub fn is_retryable(&self) -> bool {
        matches!(self, LdfdError::UpstreamUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_unavailable_is_retryable() {
        assert!(LdfdError::UpstreamUnavailable("timeout".into()).is_retryable());
    }

    #[test]
    fn checksum_mismatch_is_not_retryable() {
        let err = LdfdError::ChecksumMismatch {
            expected: "abcd".into(),
            actual: "ef12".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn template_unresolvable_is_not_retryable() {
        assert!(!LdfdError::TemplateUnresolvable("version".into()).is_retryable());
    }
}

use std::fmt;

/// Errors returned by devbox runtime operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Missing, invalid, or expired bearer token, or bad credentials.
    Unauthenticated(String),
    /// Valid identity, but the container belongs to someone else.
    Forbidden(String),
    /// No such container or principal.
    NotFound(String),
    /// The engine could not resolve the requested image.
    ImageUnavailable(String),
    /// The operation requires the container to be running.
    NotRunning(String),
    /// Container runtime failure not otherwise classified.
    EngineFailure(String),
    /// Duplicate registration or conflicting state.
    Conflict(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Internal storage/state error.
    Storage(String),
    /// A bounded operation (one-shot exec) ran past its deadline.
    Timeout(String),
}

impl SandboxError {
    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Unauthenticated(_) => "unauthenticated",
            SandboxError::Forbidden(_) => "forbidden",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::ImageUnavailable(_) => "image_unavailable",
            SandboxError::NotRunning(_) => "not_running",
            SandboxError::EngineFailure(_) => "engine_failure",
            SandboxError::Conflict(_) => "conflict",
            SandboxError::Validation(_) => "validation",
            SandboxError::Storage(_) => "storage",
            SandboxError::Timeout(_) => "timeout",
        }
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Unauthenticated(msg) => write!(f, "unauthenticated: {msg}"),
            SandboxError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            SandboxError::NotFound(msg) => write!(f, "not found: {msg}"),
            SandboxError::ImageUnavailable(msg) => write!(f, "image unavailable: {msg}"),
            SandboxError::NotRunning(msg) => write!(f, "not running: {msg}"),
            SandboxError::EngineFailure(msg) => write!(f, "engine error: {msg}"),
            SandboxError::Conflict(msg) => write!(f, "conflict: {msg}"),
            SandboxError::Validation(msg) => write!(f, "validation error: {msg}"),
            SandboxError::Storage(msg) => write!(f, "storage error: {msg}"),
            SandboxError::Timeout(msg) => write!(f, "timed out: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = SandboxError::Forbidden("ctr-1 belongs to another principal".into());
        assert_eq!(
            err.to_string(),
            "forbidden: ctr-1 belongs to another principal"
        );
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn codes_are_distinct() {
        let all = [
            SandboxError::Unauthenticated(String::new()),
            SandboxError::Forbidden(String::new()),
            SandboxError::NotFound(String::new()),
            SandboxError::ImageUnavailable(String::new()),
            SandboxError::NotRunning(String::new()),
            SandboxError::EngineFailure(String::new()),
            SandboxError::Conflict(String::new()),
            SandboxError::Validation(String::new()),
            SandboxError::Storage(String::new()),
            SandboxError::Timeout(String::new()),
        ];
        let mut codes: Vec<_> = all.iter().map(SandboxError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}

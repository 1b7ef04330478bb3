/// Provider error with retry classification.
///
/// The runtime uses `is_retryable()` to decide whether an operation is worth
/// another attempt (with backoff) or should surface immediately.
///
/// Retryable: lock contention, timeouts, temporary resource exhaustion.
/// Permanent: missing instance, malformed payloads, invalid lock tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "ack_orchestration_item").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// A transient error that may succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent error that retrying will not fix.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_preserved() {
        let transient = ProviderError::retryable("fetch_orchestration_item", "store busy");
        assert!(transient.is_retryable());

        let permanent = ProviderError::permanent("ack_orchestration_item", "unknown lock token");
        assert!(!permanent.is_retryable());
        assert_ne!(transient, permanent);

        let rendered = format!("{permanent}");
        assert!(rendered.contains("ack_orchestration_item"));
        assert!(rendered.contains("unknown lock token"));
    }
}

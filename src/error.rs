//! Error types for the cache engine.

use thiserror::Error;

/// Cache-related errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// One or more entry fields could not be converted to serialized form.
    /// The affected push event is dropped from the tick; the original
    /// write already completed locally, so this is never surfaced to it.
    #[error("serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    /// The disk tier reported an I/O failure during cleanup. Stops the
    /// current cleanup pass; the next scheduled trigger retries.
    #[error("disk tier failure: {0}")]
    Disk(String),

    /// A caller violated an entry's metadata contract. Indicates a
    /// programming error in a collaborator, not a runtime condition.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// An operation was invoked with arguments outside its contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An entry handle referenced a pool slot that has since been
    /// recycled. Use-after-release, detected by the arena's generation
    /// counter.
    #[error("stale entry handle")]
    StaleHandle,

    /// Invalid cache configuration.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Per-field serialization failure report.
///
/// Conversion does not stop at the first failing field; every failure is
/// recorded so the operator log names all of them at once.
#[derive(Debug, Error)]
#[error("{} field(s) failed to serialize", failures.len())]
pub struct SerializationError {
    /// The fields that failed, in conversion order.
    pub failures: Vec<FieldFailure>,
}

/// A single field that could not be serialized.
#[derive(Debug, Clone)]
pub struct FieldFailure {
    /// Name of the entry field.
    pub field: &'static str,
    /// Reason reported by the value's serializer.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_error_display_counts_fields() {
        let err = SerializationError {
            failures: vec![
                FieldFailure {
                    field: "value",
                    reason: "not encodable".into(),
                },
                FieldFailure {
                    field: "alias",
                    reason: "oversized".into(),
                },
            ],
        };
        assert_eq!(err.to_string(), "2 field(s) failed to serialize");
    }

    #[test]
    fn cache_error_wraps_serialization_error() {
        let err: CacheError = SerializationError { failures: vec![] }.into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn invalid_state_display() {
        let err = CacheError::InvalidState("metadata committed before id was set");
        assert_eq!(
            err.to_string(),
            "invalid state: metadata committed before id was set"
        );
    }
}

//! Unified error type for resolution and plugin operations.

use thiserror::Error;

use crate::resource::OpenMode;

/// Unified error type for `open()` and all plugin operations.
///
/// Resolution-phase errors (`UnsupportedResource`, `NoSuitableBackend`, ...)
/// are always fatal to the current call. Backend-internal decode/encode
/// failures surface as [`NdioError::FormatMismatch`] with the backend's own
/// error preserved as `source`, so callers can distinguish "couldn't find a
/// backend" from "found one but the data was bad".
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NdioError {
    /// The input is not something a request can be built from (unrecognized
    /// origin type, or an origin that makes no sense for the mode).
    #[error("unsupported resource: {0}")]
    UnsupportedResource(String),

    /// The resource exists in principle but could not be reached: missing
    /// file, network failure, HTTP error status.
    #[error("cannot reach `{identifier}`: {reason}")]
    ResourceUnavailable { identifier: String, reason: String },

    /// The backend is registered but its underlying machinery is not
    /// installed. Skip-and-continue during automatic resolution; hard
    /// failure when the backend was named explicitly.
    #[error("backend `{id}` is not available: {reason}")]
    BackendUnavailable { id: String, reason: String },

    /// Every candidate declined the resource.
    #[error("no backend accepted `{identifier}` for {mode} mode")]
    NoSuitableBackend { identifier: String, mode: OpenMode },

    /// A backend identifier that is not registered at all. Raised for
    /// explicit selection and for malformed reorder requests.
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    /// A backend accepted the resource but failed during actual
    /// decode/encode. Accepting implies commitment: this is never retried
    /// with a different backend.
    #[error("backend `{id}` failed on `{identifier}`: {source}")]
    FormatMismatch {
        id: String,
        identifier: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The backend has no element at the requested index.
    #[error("index {index} out of range for `{identifier}` ({len} elements)")]
    IndexOutOfRange {
        index: usize,
        len: usize,
        identifier: String,
    },

    /// The selected backend cannot perform the requested operation.
    #[error("backend `{id}` does not support: {detail}")]
    UnsupportedOperation { id: String, detail: &'static str },

    /// Operation on a plugin that has already been closed.
    #[error("plugin instance is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NdioError {
    /// Wrap a backend-specific error as a decode/encode failure.
    pub fn from_backend<E>(id: &str, identifier: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        NdioError::FormatMismatch {
            id: id.into(),
            identifier: identifier.into(),
            source: Box::new(error),
        }
    }

    /// Resource-access failure with a display-friendly reason.
    pub(crate) fn unavailable(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        NdioError::ResourceUnavailable {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mismatch_preserves_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated stream");
        let err = NdioError::from_backend("png", "photo.png", inner);

        assert!(matches!(err, NdioError::FormatMismatch { .. }));
        let msg = err.to_string();
        assert!(msg.contains("png"));
        assert!(msg.contains("truncated stream"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn no_suitable_backend_names_mode() {
        let err = NdioError::NoSuitableBackend {
            identifier: "mystery.bin".into(),
            mode: OpenMode::Read,
        };
        assert!(err.to_string().contains("read"));
        assert!(err.to_string().contains("mystery.bin"));
    }
}

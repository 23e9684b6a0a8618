use crate::shape::Shape;

/// All errors that can occur within kiln.
///
/// Configuration problems (bad arity, unknown blobs, mismatched shapes on
/// restore) are fatal: callers surface them and never retry. Accelerator
/// allocation failure is the one recoverable condition, see
/// [`Error::is_recoverable`]. Numeric precondition violations such as an
/// out-of-range axis are not represented here; they panic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network, layer, or solver configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Shape mismatch between two tensors (e.g. restoring [2,3] into [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// A device-side pointer was requested but no accelerator is configured.
    #[error("no accelerator configured: device memory is unavailable in host mode")]
    NoAccelerator,

    /// Allocation failure on the named device.
    #[error("out of memory on {device}: requested {bytes} bytes")]
    OutOfMemory { device: String, bytes: usize },

    /// Externally supplied memory has the wrong length for the buffer adopting it.
    #[error("buffer size mismatch: expected {expected} elements, got {got}")]
    BufferSize { expected: usize, got: usize },

    /// A host/device transfer failed.
    #[error("device error: {0}")]
    Device(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a configuration error.
    pub fn config(s: impl Into<String>) -> Self {
        Error::Config(s.into())
    }

    /// Whether the caller may reasonably fall back (e.g. to a host-only path).
    ///
    /// Only accelerator allocation failures qualify.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfMemory { device, .. } if device != "host")
    }
}

/// Convenience Result type used throughout kiln.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

/// Early return with a [`Error::Config`].
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Config(format!($($arg)*)))
    };
}

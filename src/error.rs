use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

/// Failure model of the query engine.
///
/// The coordinator never propagates these outward: public operations resolve
/// to data or `None`, and the last error is surfaced through
/// `QueryState::error`.
#[derive(Debug, From)]
pub enum Error {
    /// The user fetcher failed.
    Fetch(String),

    /// The user transform failed; wraps the underlying message.
    Transform(String),

    /// The fetch was aborted. Never surfaced, never retried.
    Aborted,

    #[from]
    Json(serde_json::Error),

    #[from]
    Io(std::io::Error),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Adapt any displayable error into a fetcher error.
    pub fn fetch(err: impl std::fmt::Display) -> Self {
        Self::Fetch(err.to_string())
    }

    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Fetch(msg) | Self::Custom(msg) => write!(fmt, "{msg}"),
            Self::Transform(msg) => write!(fmt, "transform failed: {msg}"),
            Self::Aborted => write!(fmt, "fetch aborted"),
            Self::Json(err) => write!(fmt, "{err}"),
            Self::Io(err) => write!(fmt, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_displays_bare_message() {
        let err = Error::fetch("connection refused");
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn test_transform_error_is_tagged() {
        let err = Error::Transform("bad payload".to_string());
        assert_eq!(err.to_string(), "transform failed: bad payload");
    }

    #[test]
    fn test_aborted_marker() {
        assert!(Error::Aborted.is_aborted());
        assert!(!Error::fetch("x").is_aborted());
    }
}

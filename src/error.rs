//! Error taxonomy for the NVR core.
//!
//! Component boundaries return `NvrError`; the HTTP layer maps the variants
//! onto status codes (`InvalidInput` -> 400, `NotFound` -> 404, `Conflict`
//! -> 400 with a descriptive message, everything else -> 500). Transient
//! upstream failures never reach this type: the per-camera supervisor
//! retries them internally.

use std::fmt;
use std::io;

/// Result alias used throughout the core.
pub type NvrResult<T> = Result<T, NvrError>;

#[derive(Debug)]
pub enum NvrError {
    /// Missing or unparsable caller input.
    InvalidInput(String),
    /// Unknown camera or region.
    NotFound(String),
    /// Duplicate camera name or mount.
    Conflict(String),
    /// The media graph could not be constructed.
    PipelineBuild(String),
    /// The RTSP proxy failed (start, mount, ...).
    Proxy(String),
    /// Clip export failed; carries the concat-demuxer diagnostics.
    Export(String),
    /// Filesystem failure with the operation that hit it.
    Io { op: String, source: io::Error },
}

impl NvrError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        NvrError::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        NvrError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        NvrError::Conflict(msg.into())
    }

    pub fn io(op: impl Into<String>, source: io::Error) -> Self {
        NvrError::Io { op: op.into(), source }
    }
}

impl fmt::Display for NvrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvrError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            NvrError::NotFound(msg) => write!(f, "not found: {msg}"),
            NvrError::Conflict(msg) => write!(f, "conflict: {msg}"),
            NvrError::PipelineBuild(msg) => write!(f, "pipeline build failed: {msg}"),
            NvrError::Proxy(msg) => write!(f, "rtsp proxy error: {msg}"),
            NvrError::Export(msg) => write!(f, "export failed: {msg}"),
            NvrError::Io { op, source } => write!(f, "i/o error during {op}: {source}"),
        }
    }
}

impl std::error::Error for NvrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NvrError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<nvr_rtsp::ProxyError> for NvrError {
    fn from(e: nvr_rtsp::ProxyError) -> Self {
        match e {
            nvr_rtsp::ProxyError::MountExists(path) => {
                NvrError::Conflict(format!("mount already exists: {path}"))
            }
            other => NvrError::Proxy(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_operation() {
        let err = NvrError::io("copy segment", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("copy segment"));
    }
}

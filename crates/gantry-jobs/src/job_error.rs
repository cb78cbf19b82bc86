//! Errors raised by job handlers.

use std::fmt;

/// Machine-readable error codes a handler failure may carry.
///
/// Names follow the POSIX/libuv codes the external tools report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    NotADirectory,
    PermissionDenied,
    InvalidArgument,
    AlreadyExists,
    DnsFailure,
    ConnectionRefused,
    TimedOut,
    ConnectionReset,
    TemporarilyUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::NotADirectory => "ENOTDIR",
            ErrorCode::PermissionDenied => "EACCES",
            ErrorCode::InvalidArgument => "EINVAL",
            ErrorCode::AlreadyExists => "EEXIST",
            ErrorCode::DnsFailure => "ENOTFOUND",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::TimedOut => "ETIMEDOUT",
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::TemporarilyUnavailable => "EAGAIN",
        }
    }

    /// Parse a code name. `EPERM` is accepted as an alias of `EACCES`.
    pub fn parse(code: &str) -> Option<Self> {
        let code = match code.to_ascii_uppercase().as_str() {
            "ENOENT" => ErrorCode::NotFound,
            "ENOTDIR" => ErrorCode::NotADirectory,
            "EACCES" | "EPERM" => ErrorCode::PermissionDenied,
            "EINVAL" => ErrorCode::InvalidArgument,
            "EEXIST" => ErrorCode::AlreadyExists,
            "ENOTFOUND" => ErrorCode::DnsFailure,
            "ECONNREFUSED" => ErrorCode::ConnectionRefused,
            "ETIMEDOUT" => ErrorCode::TimedOut,
            "ECONNRESET" => ErrorCode::ConnectionReset,
            "EAGAIN" => ErrorCode::TemporarilyUnavailable,
            _ => return None,
        };
        Some(code)
    }

    /// Map an I/O error kind onto a code, if one corresponds.
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Option<Self> {
        use std::io::ErrorKind;
        let code = match kind {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            ErrorKind::TimedOut => ErrorCode::TimedOut,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ErrorCode::ConnectionReset
            }
            ErrorKind::WouldBlock | ErrorKind::Interrupted => ErrorCode::TemporarilyUnavailable,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a job handler.
///
/// Carries whatever the classifier can use: an error code, an HTTP-like
/// status, and the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}{}", failure_detail(.code, .status))]
pub struct JobError {
    message: String,
    code: Option<ErrorCode>,
    status: Option<u16>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Failure carrying only an HTTP-like status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message).with_code(ErrorCode::TimedOut)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

fn failure_detail(code: &Option<ErrorCode>, status: &Option<u16>) -> String {
    match (code, status) {
        (Some(code), _) => format!(" ({code})"),
        (None, Some(status)) => format!(" (HTTP {status})"),
        (None, None) => String::new(),
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        let code = ErrorCode::from_io_kind(e.kind());
        Self {
            message: e.to_string(),
            code,
            status: None,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(job_error) = e.downcast_ref::<JobError>() {
            return job_error.clone();
        }
        let code = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| ErrorCode::from_io_kind(io.kind()));
        Self {
            message: format!("{e:#}"),
            code,
            status: None,
        }
    }
}

impl From<gantry_core::Error> for JobError {
    fn from(e: gantry_core::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names_parse_back() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::NotADirectory,
            ErrorCode::PermissionDenied,
            ErrorCode::InvalidArgument,
            ErrorCode::AlreadyExists,
            ErrorCode::DnsFailure,
            ErrorCode::ConnectionRefused,
            ErrorCode::TimedOut,
            ErrorCode::ConnectionReset,
            ErrorCode::TemporarilyUnavailable,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("eperm"), Some(ErrorCode::PermissionDenied));
        assert_eq!(ErrorCode::parse("EWHATEVER"), None);
    }

    #[test]
    fn test_from_io_error_maps_kind() {
        let err: JobError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.code(), Some(ErrorCode::NotFound));
        assert!(err.message().contains("missing"));

        let err: JobError = std::io::Error::new(std::io::ErrorKind::Other, "odd").into();
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_from_anyhow_downcasts_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: JobError = anyhow::Error::new(io).context("cloning repo").into();
        assert_eq!(err.code(), Some(ErrorCode::ConnectionReset));
        assert!(err.message().contains("cloning repo"));
    }

    #[test]
    fn test_from_anyhow_preserves_job_error() {
        let original = JobError::http(503, "upstream down");
        let err: JobError = anyhow::Error::new(original.clone()).into();
        assert_eq!(err, original);
    }

    #[test]
    fn test_display_includes_code_or_status() {
        assert_eq!(
            JobError::new("gone").with_code(ErrorCode::NotFound).to_string(),
            "gone (ENOENT)"
        );
        assert_eq!(JobError::http(429, "slow down").to_string(), "slow down (HTTP 429)");
        assert_eq!(JobError::new("plain").to_string(), "plain");
    }
}

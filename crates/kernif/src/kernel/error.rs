//! Error types for kernel interface operations.
//!
//! Every failure carries a classification ([`ErrorKind`]) that drives the
//! dispatcher's fail-over decision: only [`ErrorKind::BackendUnusable`]
//! failures move on to the next backend.

use std::io;

use super::capability::Operation;

/// Result type for kernel interface operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The backend cannot currently serve any request (control channel down).
    BackendUnusable,
    /// The OS rejected this specific request; retrying reproduces the rejection.
    Rejected,
    /// The identity does not exist in the backend.
    NotFound,
    /// No registered, healthy backend is capable of the operation.
    NoBackend,
    /// The caller passed an invalid argument.
    Invalid,
    /// The dispatcher is shutting down.
    ShuttingDown,
}

/// Errors that can occur during kernel interface operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on a backend's control channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// The backend cannot serve requests.
    #[error("backend {backend} unusable: {reason}")]
    BackendUnusable {
        /// Backend name.
        backend: String,
        /// Why it is unusable.
        reason: String,
    },

    /// The request was rejected as semantically invalid.
    #[error("{operation} rejected: {reason}")]
    Rejected {
        /// The operation that was rejected.
        operation: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The identity is unknown to the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// No capable backend is registered and healthy.
    #[error("no backend available for {operation}")]
    NoBackend {
        /// The operation that could not be dispatched.
        operation: Operation,
    },

    /// SPI allocation could not find a free value.
    #[error("no free SPI for {protocol} to {dst} after {attempts} attempts")]
    SpiExhausted {
        /// Destination address.
        dst: std::net::IpAddr,
        /// Protocol name.
        protocol: &'static str,
        /// How many candidates were tried.
        attempts: u32,
    },

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The dispatcher no longer accepts operations.
    #[error("kernel interface is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a kernel error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Create a kernel error with operation context.
    pub fn from_errno_with_context(errno: i32, operation: impl Into<String>) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::KernelWithContext {
            operation: operation.into(),
            errno: -errno,
            message,
        }
    }

    /// Create an "unusable backend" error.
    pub fn unusable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnusable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a "rejected" error.
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::BackendUnusable { .. } => ErrorKind::BackendUnusable,
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                classify_errno(*errno)
            }
            Self::Rejected { .. } | Self::SpiExhausted { .. } => ErrorKind::Rejected,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoBackend { .. } => ErrorKind::NoBackend,
            Self::InvalidArgument(_) | Self::InvalidConfig(_) => ErrorKind::Invalid,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Check if the backend that produced this error should be marked unhealthy.
    pub fn is_backend_unusable(&self) -> bool {
        self.kind() == ErrorKind::BackendUnusable
    }

    /// Check if this is a "not found" error (ENOENT, ESRCH, etc.).
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM | libc::EACCES))
    }

    /// Check if this is a "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Map a (positive) errno to a failure classification.
fn classify_errno(errno: i32) -> ErrorKind {
    match errno {
        libc::ENOENT | libc::ESRCH | libc::ENODEV | libc::EADDRNOTAVAIL => ErrorKind::NotFound,
        libc::EBADF
        | libc::ENOTCONN
        | libc::ENOTSOCK
        | libc::EPIPE
        | libc::ECONNREFUSED
        | libc::ECONNRESET
        | libc::ESHUTDOWN => ErrorKind::BackendUnusable,
        _ => ErrorKind::Rejected,
    }
}

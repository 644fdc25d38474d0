//! Error types for board access.
//!
//! Every fallible call in this crate returns [`LmsError`]. Callers that only
//! need the coarse category can match on [`LmsError::kind`].
//!
//! An optional process-wide diagnostic sink can observe reported errors for
//! logging purposes. It never influences control flow.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

use crate::protocol::{Command, Status};

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, LmsError>;

/// Errors that can occur when talking to a board.
#[derive(Error, Debug)]
pub enum LmsError {
    /// Argument out of range (channel, payload size, frequency, ...)
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// No device matched, or the transport is not open
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// Capability absent on this transport variant or board
    #[error("Operation not supported: {message}")]
    NotSupported { message: String },

    /// Device, PLL or MCU refused the request
    #[error("Device busy: {message}")]
    Busy { message: String },

    /// A bounded poll or transfer deadline expired
    #[error("Timed out: {message}")]
    Timeout { message: String },

    /// The board answered with a status other than "completed"
    #[error("Command {command} failed with status {status}")]
    Protocol { command: Command, status: Status },

    /// Unrecoverable I/O failure, usually device removal
    #[error("Transport failure after {transferred} bytes: {source}")]
    TransportFatal {
        transferred: usize,
        #[source]
        source: std::io::Error,
    },

    /// Cooperative cancellation was requested
    #[error("Operation aborted: {message}")]
    Aborted { message: String },

    /// Local I/O error (firmware files, device node probing)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`LmsError::InvalidArgument`].
    InvalidArgument,
    /// See [`LmsError::NotConnected`].
    NotConnected,
    /// See [`LmsError::NotSupported`].
    NotSupported,
    /// See [`LmsError::Busy`].
    Busy,
    /// See [`LmsError::Timeout`].
    Timeout,
    /// See [`LmsError::Protocol`].
    Protocol,
    /// See [`LmsError::TransportFatal`].
    TransportFatal,
    /// See [`LmsError::Aborted`].
    Aborted,
    /// See [`LmsError::Io`].
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotConnected => "not connected",
            Self::NotSupported => "not supported",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol error",
            Self::TransportFatal => "transport fatal",
            Self::Aborted => "aborted",
            Self::Io => "i/o",
        };
        f.write_str(name)
    }
}

impl LmsError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub(crate) fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub(crate) fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::TransportFatal { .. } => ErrorKind::TransportFatal,
            Self::Aborted { .. } => ErrorKind::Aborted,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Check if this is a timeout (transfer or poll deadline).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the device is gone and the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportFatal { .. })
    }

    /// Check if this error means "no such device".
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }

    /// Forward this error to the diagnostic sink and the log, then return it.
    ///
    /// Called once per failure, where an error leaves the public API.
    pub fn report(self) -> Self {
        let kind = self.kind();
        let message = self.to_string();
        warn!(kind = %kind, "{message}");
        if let Some(sink) = DIAGNOSTIC_SINK.read().as_ref() {
            sink(kind, &message);
        }
        self
    }
}

/// Observer for reported errors. Receives the category and the rendered message.
pub type DiagnosticSink = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;

static DIAGNOSTIC_SINK: RwLock<Option<DiagnosticSink>> = parking_lot::const_rwlock(None);

/// Install (or clear, with `None`) the process-wide diagnostic sink.
///
/// The sink is shared by every thread; concurrent failures are delivered in
/// whatever order they are reported.
pub fn set_diagnostic_sink(sink: Option<DiagnosticSink>) {
    *DIAGNOSTIC_SINK.write() = sink;
}

pub(crate) trait ResultExt<T> {
    fn reported(self) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn reported(self) -> Result<T> {
        self.map_err(LmsError::report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serial_test::serial;

    #[test]
    fn test_error_display() {
        let err = LmsError::invalid_argument("channel 3 out of range");
        assert_eq!(err.to_string(), "Invalid argument: channel 3 out of range");

        let err = LmsError::Protocol {
            command: Command::BoardSpiWrite,
            status: Status::Busy,
        };
        assert!(err.to_string().contains("BRDSPI16_WR"));
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_kind_predicates() {
        let err = LmsError::TransportFatal {
            transferred: 12,
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        };
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::TransportFatal);
        assert!(LmsError::timeout("poll").is_timeout());
        assert!(LmsError::not_connected("none").is_not_connected());
    }

    #[test]
    #[serial]
    fn test_diagnostic_sink_receives_reports() {
        // Other tests in this binary report too; keep only ours.
        let seen: Arc<Mutex<Vec<ErrorKind>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        set_diagnostic_sink(Some(Arc::new(move |kind, msg| {
            if msg.contains("sink-check") {
                seen_clone.lock().push(kind);
            }
        })));

        let _ = LmsError::busy("pll sink-check").report();
        let _ = Err::<(), _>(LmsError::aborted("user sink-check")).reported();

        set_diagnostic_sink(None);
        let _ = LmsError::busy("ignored sink-check").report();

        assert_eq!(*seen.lock(), vec![ErrorKind::Busy, ErrorKind::Aborted]);
    }
}

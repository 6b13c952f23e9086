use std::io;
use std::sync::Arc;
use std::time::Duration;

use baratron_core::protocol::ProtocolError;
use baratron_core::{BoxStr, Field};
use thiserror::Error;

/// Socket-level failures. Any of these leaves the connection closed.
///
/// Errors are `Clone` so a single failure can be handed to every request
/// waiting on the same device.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: BoxStr,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("timed out connecting to {addr} after {after:?}")]
    ConnectTimeout { addr: BoxStr, after: Duration },
    #[error("not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    Write(#[source] Arc<io::Error>),
    #[error("read failed: {0}")]
    Read(#[source] Arc<io::Error>),
    #[error("device closed the connection")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("unsupported field `{0}`")]
    UnsupportedField(BoxStr),
    #[error("field `{0}` is read-only")]
    ReadOnlyField(Field),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: Field, reason: BoxStr },
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol desync: {0}")]
    ProtocolDesync(BoxStr),
    #[error("malformed response for `{field}`: {raw:?}")]
    MalformedResponse { field: Field, raw: BoxStr },
    #[error("device reported error {code} for `{field}`")]
    DeviceError { field: Field, code: u16 },
    #[error("dispatcher shut down")]
    Shutdown,
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedField(name) => Error::UnsupportedField(name),
            ProtocolError::ReadOnlyField(field) => Error::ReadOnlyField(field),
            ProtocolError::InvalidValue { field, reason } => Error::InvalidValue { field, reason },
            ProtocolError::MalformedResponse { field, raw } => {
                Error::MalformedResponse { field, raw }
            }
            ProtocolError::DeviceFault { field, code } => Error::DeviceError { field, code },
            ProtocolError::FieldMismatch { expected, actual } => Error::ProtocolDesync(
                format!("expected reply for `{}`, got `{actual}`", expected.tag()).into(),
            ),
            ProtocolError::MalformedCommand(raw) => Error::ProtocolDesync(raw),
        }
    }
}

impl Error {
    /// Whether the error came from local validation, before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedField(_) | Error::ReadOnlyField(_) | Error::InvalidValue { .. }
        )
    }
}

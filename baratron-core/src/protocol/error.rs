use crate::{BoxStr, Field};

pub type ParseResult<T> = core::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported field `{0}`")]
    UnsupportedField(BoxStr),
    #[error("field `{0}` is read-only")]
    ReadOnlyField(Field),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: Field, reason: BoxStr },
    #[error("malformed response for `{field}`: {raw:?}")]
    MalformedResponse { field: Field, raw: BoxStr },
    #[error("device fault {code} reading `{field}`")]
    DeviceFault { field: Field, code: u16 },
    #[error("reply tagged `{actual}` while waiting for `{expected}`")]
    FieldMismatch { expected: Field, actual: BoxStr },
    #[error("malformed command: {0:?}")]
    MalformedCommand(BoxStr),
}

use thiserror::Error;

/// Errors raised while framing or decoding the wire protocol.
///
/// Every variant maps 1:1 onto a wire-visible failure mode from the protocol
/// design: a caller that gets `UnsupportedVersion` or `InvalidFrame` knows the
/// connection is no longer salvageable and must close it.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame length {0} exceeds configured maximum {1}")]
    InvalidFrame(u32, u32),
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown command code: {0}")]
    UnknownCommand(u8),
    #[error("field too large: {field} ({len} bytes, max {max})")]
    FieldTooLarge { field: &'static str, len: usize, max: usize },
    #[error("message body truncated while decoding {0}")]
    Truncated(&'static str),
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

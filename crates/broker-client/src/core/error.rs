use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("connection closed while request was in flight")]
    Disconnected,
    #[error("broker rejected request: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] broker_proto::ProtoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

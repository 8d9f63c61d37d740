mod error;
mod frame;
mod message;

pub use error::ProtoError;
pub use frame::{DEFAULT_MAX_FRAME_LEN, read_frame_sync, write_frame_sync};
#[cfg(feature = "tokio")]
pub use frame::{read_frame_async, write_frame_async};
pub use message::{CommandCode, ProtocolMessage, SCHEMA_VERSION};

use std::collections::HashMap;

use crate::error::ProtoError;

/// Current wire schema version. The codec rejects any other value with
/// [`ProtoError::UnsupportedVersion`] rather than guessing at forward
/// compatibility.
pub const SCHEMA_VERSION: u8 = 1;

const MAX_STRING_LEN: usize = u16::MAX as usize;
const MAX_HEADER_COUNT: usize = u16::MAX as usize;
const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Command codes making up the broker's state machine. Numeric values are
/// part of the wire contract and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    Connect = 1,
    ConnectAck = 2,
    Disconnect = 3,
    Ping = 4,
    Pong = 5,
    Publish = 6,
    PublishAck = 7,
    Subscribe = 8,
    SubscribeAck = 9,
    Unsubscribe = 10,
    UnsubscribeAck = 11,
    Deliver = 12,
    Ack = 13,
    CreateQueue = 14,
    DeleteQueue = 15,
    QueueInfo = 16,
    ListQueues = 17,
    ListDlq = 18,
    ReplayDlq = 19,
    Error = 20,
}

impl CommandCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CommandCode::*;
        let code = match value {
            1 => Connect,
            2 => ConnectAck,
            3 => Disconnect,
            4 => Ping,
            5 => Pong,
            6 => Publish,
            7 => PublishAck,
            8 => Subscribe,
            9 => SubscribeAck,
            10 => Unsubscribe,
            11 => UnsubscribeAck,
            12 => Deliver,
            13 => Ack,
            14 => CreateQueue,
            15 => DeleteQueue,
            16 => QueueInfo,
            17 => ListQueues,
            18 => ListDlq,
            19 => ReplayDlq,
            20 => Error,
            other => return Err(ProtoError::UnknownCommand(other)),
        };
        Ok(code)
    }
}

/// A decoded protocol message: the body framed by [`crate::frame`].
///
/// Field order here is the wire order; `encode`/`decode` must stay in lock
/// step with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub command: CommandCode,
    pub id: String,
    pub queue: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub headers: HashMap<String, String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ProtocolMessage {
    pub fn new(command: CommandCode, id: impl Into<String>) -> Self {
        Self {
            command,
            id: id.into(),
            queue: None,
            payload: None,
            headers: HashMap::new(),
            error_code: None,
            error_message: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Encodes this message into its wire body (the frame payload).
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64 + self.payload.as_ref().map_or(0, Vec::len));
        out.push(SCHEMA_VERSION);
        out.push(self.command.as_u8());
        write_string(&mut out, "id", &self.id)?;
        write_optional_string(&mut out, "queue", self.queue.as_deref())?;
        write_optional_bytes(&mut out, self.payload.as_deref())?;
        write_headers(&mut out, &self.headers)?;
        write_optional_string(&mut out, "error_code", self.error_code.as_deref())?;
        write_optional_string(&mut out, "error_message", self.error_message.as_deref())?;
        Ok(out)
    }

    /// Decodes a wire body produced by [`ProtocolMessage::encode`].
    pub fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        let mut cursor = Cursor::new(body);
        let schema_version = cursor.read_u8("schema_version")?;
        if schema_version != SCHEMA_VERSION {
            return Err(ProtoError::UnsupportedVersion(schema_version));
        }

        let command = CommandCode::try_from(cursor.read_u8("command")?)?;
        let id = cursor.read_string("id")?;
        let queue = cursor.read_optional_string("queue")?;
        let payload = cursor.read_optional_bytes("payload")?;
        let headers = cursor.read_headers()?;
        let error_code = cursor.read_optional_string("error_code")?;
        let error_message = cursor.read_optional_string("error_message")?;

        Ok(Self { command, id, queue, payload, headers, error_code, error_message })
    }
}

fn write_string(out: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), ProtoError> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(ProtoError::FieldTooLarge { field, len: bytes.len(), max: MAX_STRING_LEN });
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_optional_string(
    out: &mut Vec<u8>,
    field: &'static str,
    value: Option<&str>,
) -> Result<(), ProtoError> {
    write_string(out, field, value.unwrap_or(""))
}

fn write_optional_bytes(out: &mut Vec<u8>, value: Option<&[u8]>) -> Result<(), ProtoError> {
    let bytes = value.unwrap_or(&[]);
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(ProtoError::FieldTooLarge {
            field: "payload",
            len: bytes.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_headers(
    out: &mut Vec<u8>,
    headers: &HashMap<String, String>,
) -> Result<(), ProtoError> {
    if headers.len() > MAX_HEADER_COUNT {
        return Err(ProtoError::FieldTooLarge {
            field: "headers",
            len: headers.len(),
            max: MAX_HEADER_COUNT,
        });
    }
    out.extend_from_slice(&(headers.len() as u16).to_be_bytes());
    for (key, value) in headers {
        write_string(out, "header_key", key)?;
        write_string(out, "header_value", value)?;
    }
    Ok(())
}

/// A small cursor over the decode buffer; keeps `decode` free of manual
/// bounds-checking noise.
struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], ProtoError> {
        let end = self.pos.checked_add(len).ok_or(ProtoError::Truncated(field))?;
        let slice = self.body.get(self.pos..end).ok_or(ProtoError::Truncated(field))?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, ProtoError> {
        Ok(self.take(1, field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, ProtoError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32, ProtoError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, ProtoError> {
        let len = self.read_u16(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::InvalidUtf8(field))
    }

    fn read_optional_string(
        &mut self,
        field: &'static str,
    ) -> Result<Option<String>, ProtoError> {
        let value = self.read_string(field)?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    fn read_optional_bytes(&mut self, field: &'static str) -> Result<Option<Vec<u8>>, ProtoError> {
        let len = self.read_u32(field)? as usize;
        let bytes = self.take(len, field)?;
        Ok(if bytes.is_empty() { None } else { Some(bytes.to_vec()) })
    }

    fn read_headers(&mut self) -> Result<HashMap<String, String>, ProtoError> {
        let count = self.read_u16("headers")? as usize;
        let mut headers = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string("header_key")?;
            let value = self.read_string("header_value")?;
            headers.insert(key, value);
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_minimal() {
        let msg = ProtocolMessage::new(CommandCode::Ping, "abc");
        let encoded = msg.encode().unwrap();
        let decoded = ProtocolMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_full() {
        let msg = ProtocolMessage::new(CommandCode::Publish, "msg-1")
            .with_queue("orders")
            .with_payload(b"{\"k\":\"v\"}".to_vec())
            .with_header("priority", "high")
            .with_error("QUEUE_FULL", "queue is full");
        let encoded = msg.encode().unwrap();
        let decoded = ProtocolMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn rejects_unsupported_schema_version() {
        let msg = ProtocolMessage::new(CommandCode::Ping, "abc");
        let mut encoded = msg.encode().unwrap();
        encoded[0] = 9;
        let err = ProtocolMessage::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtoError::UnsupportedVersion(9)));
    }

    #[test]
    fn rejects_unknown_command() {
        let msg = ProtocolMessage::new(CommandCode::Ping, "abc");
        let mut encoded = msg.encode().unwrap();
        encoded[1] = 250;
        let err = ProtocolMessage::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownCommand(250)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let msg = ProtocolMessage::new(CommandCode::Publish, "msg-1").with_queue("orders");
        let mut encoded = msg.encode().unwrap();
        encoded.truncate(encoded.len() - 3);
        let err = ProtocolMessage::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated(_)));
    }
}

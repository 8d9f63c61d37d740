use std::io::{Read, Write};

#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Default cap on a single frame body, matching the broker's default
/// `maxMessageSize` (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Writes one length-prefixed frame (`len:u32be || body`) in a single
/// logical write: the prefix and the body are never observed apart by a
/// concurrent reader of the same stream.
pub fn write_frame_sync<W: Write>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ProtoError> {
    let len = u32::try_from(body.len())
        .map_err(|_| ProtoError::InvalidFrame(u32::MAX, u32::MAX))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    Ok(())
}

/// Reads one length-prefixed frame, rejecting bodies larger than
/// `max_frame_len`.
pub fn read_frame_sync<R: Read>(
    reader: &mut R,
    max_frame_len: u32,
) -> Result<Vec<u8>, ProtoError> {
    let mut len_buf = [0_u8; 4];
    read_exact_or_eof(reader, &mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_len {
        return Err(ProtoError::InvalidFrame(len, max_frame_len));
    }

    let mut body = vec![0_u8; len as usize];
    reader.read_exact(&mut body).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::UnexpectedEof
        } else {
            ProtoError::Io(err)
        }
    })?;
    Ok(body)
}

fn read_exact_or_eof<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ProtoError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::UnexpectedEof
        } else {
            ProtoError::Io(err)
        }
    })
}

#[cfg(feature = "tokio")]
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ProtoError> {
    let len = u32::try_from(body.len())
        .map_err(|_| ProtoError::InvalidFrame(u32::MAX, u32::MAX))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_len: u32,
) -> Result<Vec<u8>, ProtoError> {
    let mut len_buf = [0_u8; 4];
    read_exact_async_or_eof(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_len {
        return Err(ProtoError::InvalidFrame(len, max_frame_len));
    }

    let mut body = vec![0_u8; len as usize];
    read_exact_async_or_eof(reader, &mut body).await?;
    Ok(body)
}

#[cfg(feature = "tokio")]
async fn read_exact_async_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ProtoError> {
    reader.read_exact(buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::UnexpectedEof
        } else {
            ProtoError::Io(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn round_trip_sync() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let body = read_frame_sync(&mut cursor, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, &vec![0_u8; 100]).unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_frame_sync(&mut cursor, 10).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidFrame(100, 10)));
    }

    #[test]
    fn unexpected_eof_mid_frame() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, b"hello").unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = Cursor::new(buf);
        let err = read_frame_sync(&mut cursor, DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedEof));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn round_trip_async() {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, b"async-hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let body =
            read_frame_async(&mut cursor, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(body, b"async-hello");
    }
}

//! Length-prefixed record codec for control sub-streams.
//!
//! A record is a `u32` big-endian length followed by that many bytes of JSON.
//! Both sides of the wire use the same encoding; the data sub-stream bypasses
//! this module entirely.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtoError;

/// Upper bound on a single record. A warp state snapshot with hundreds of
/// users stays well under this.
pub const MAX_RECORD: usize = 1024 * 1024;

/// Encode a record into a single contiguous buffer, ready to be written to a
/// sub-stream in one call.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Bytes, ProtoError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_RECORD {
        return Err(ProtoError::RecordTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Read one record. An end-of-stream on the length prefix is reported as
/// [`ProtoError::Closed`]; a truncation inside the body surfaces as an i/o
/// error since it means the peer died mid-record.
pub async fn read_record<T, R>(reader: &mut R) -> Result<T, ProtoError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtoError::Closed);
        }
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RECORD {
        return Err(ProtoError::RecordTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write one record and flush.
pub async fn write_record<T, W>(writer: &mut W, value: &T) -> Result<(), ProtoError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let buf = encode_record(value)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

//! Length-prefixed record framing
//!
//! Every persisted record and every outbound report payload is one frame:
//! a little-endian u32 length followed by that many bytes of JSON. Frames
//! concatenate, so a file of appended snapshots decodes with
//! `decode_frames`.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StorageError};

/// Encode one value as a length-prefixed frame
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    Ok(frame_bytes(&payload))
}

/// Wrap already-encoded payload bytes in a frame
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Decode one frame from the front of `buf`, returning the value and the
/// number of bytes consumed
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize)> {
    if buf.len() < 4 {
        return Err(StorageError::corrupt(format!(
            "frame header needs 4 bytes, have {}",
            buf.len()
        )));
    }
    let mut header = &buf[..4];
    let len = header.get_u32_le() as usize;
    let end = 4 + len;
    if buf.len() < end {
        return Err(StorageError::corrupt(format!(
            "frame payload needs {} bytes, have {}",
            len,
            buf.len() - 4
        )));
    }
    let value = serde_json::from_slice(&buf[4..end])?;
    Ok((value, end))
}

/// Decode every frame in `buf`
pub fn decode_frames<T: DeserializeOwned>(mut buf: &[u8]) -> Result<Vec<T>> {
    let mut values = Vec::new();
    while !buf.is_empty() {
        let (value, consumed) = decode_frame(buf)?;
        values.push(value);
        buf = &buf[consumed..];
    }
    Ok(values)
}

//! Message types and the message-set wire codec
//!
//! Messages are stored on disk as *message sets*: contiguous sequences of
//! framed messages. Each frame is self-describing so that a follower
//! replicating raw bytes from its leader can recover the leader-assigned
//! offsets and timestamps without any out-of-band metadata.
//!
//! # Frame format (big-endian)
//!
//! ```text
//! +----------------+------------------+----------+------------+---------+
//! | offset: i64    | timestamp: i64   | crc: u32 | size: u32  | payload |
//! +----------------+------------------+----------+------------+---------+
//! ```
//!
//! `crc` is a CRC32 over the payload. The payload encodes key, value and
//! headers:
//!
//! ```text
//! key_len: i32 (-1 = no key) | key | value_len: u32 | value |
//! header_count: u32 | (name_len: u32 | name | value_len: u32 | value)*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RillError};

/// Width of the fixed frame header: offset + timestamp + crc + size.
pub const FRAME_HEADER_LEN: usize = 8 + 8 + 4 + 4;

/// Upper bound on a single frame payload, used to reject garbage sizes
/// before allocating.
const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

/// A message header (name-value pair)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name
    pub name: String,

    /// Header value
    pub value: Bytes,
}

impl Header {
    /// Create a new header.
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single message in a partition's commit log
///
/// `offset` and `timestamp` are assigned by the log on append: the offset
/// always, the timestamp only when the caller left it at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Offset of this message within the partition. Assigned on append.
    pub offset: i64,

    /// Timestamp in milliseconds since the epoch. Assigned on append
    /// when 0.
    pub timestamp: i64,

    /// Optional key, used by log compaction.
    pub key: Option<Bytes>,

    /// Message value.
    pub value: Bytes,

    /// Optional headers.
    pub headers: Vec<Header>,
}

impl Message {
    /// Create a new message with the given value.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            offset: 0,
            timestamp: 0,
            key: None,
            value: value.into(),
            headers: Vec::new(),
        }
    }

    /// Create a new keyed message.
    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(value)
        }
    }

    /// Attach headers to the message.
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    /// Encode one frame into `buf`, returning the frame's total length.
    pub(crate) fn encode(&self, buf: &mut BytesMut) -> usize {
        let mut payload = BytesMut::with_capacity(self.payload_size_hint());
        match &self.key {
            Some(key) => {
                payload.put_i32(key.len() as i32);
                payload.put_slice(key);
            }
            None => payload.put_i32(-1),
        }
        payload.put_u32(self.value.len() as u32);
        payload.put_slice(&self.value);
        payload.put_u32(self.headers.len() as u32);
        for header in &self.headers {
            payload.put_u32(header.name.len() as u32);
            payload.put_slice(header.name.as_bytes());
            payload.put_u32(header.value.len() as u32);
            payload.put_slice(&header.value);
        }

        let crc = crc32fast::hash(&payload);
        buf.put_i64(self.offset);
        buf.put_i64(self.timestamp);
        buf.put_u32(crc);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        FRAME_HEADER_LEN + payload.len()
    }

    fn payload_size_hint(&self) -> usize {
        let key_len = self.key.as_ref().map(|k| k.len()).unwrap_or(0);
        let headers_len: usize = self
            .headers
            .iter()
            .map(|h| 8 + h.name.len() + h.value.len())
            .sum();
        4 + key_len + 4 + self.value.len() + 4 + headers_len
    }

    /// Decode a message from a frame header and its payload bytes,
    /// verifying the payload CRC.
    pub(crate) fn decode(header: FrameHeader, payload: &[u8]) -> Result<Self> {
        let computed = crc32fast::hash(payload);
        if computed != header.crc {
            return Err(RillError::Corrupted(format!(
                "message CRC mismatch at offset {}: stored {:#010x}, computed {:#010x}",
                header.offset, header.crc, computed
            )));
        }

        let mut buf = payload;
        let key_len = read_i32(&mut buf, header.offset)?;
        let key = if key_len < 0 {
            None
        } else {
            Some(read_bytes(&mut buf, key_len as usize, header.offset)?)
        };
        let value_len = read_u32(&mut buf, header.offset)? as usize;
        let value = read_bytes(&mut buf, value_len, header.offset)?;
        let header_count = read_u32(&mut buf, header.offset)?;
        let mut headers = Vec::with_capacity(header_count as usize);
        for _ in 0..header_count {
            let name_len = read_u32(&mut buf, header.offset)? as usize;
            let name_bytes = read_bytes(&mut buf, name_len, header.offset)?;
            let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| {
                RillError::Corrupted(format!(
                    "non-utf8 header name at offset {}",
                    header.offset
                ))
            })?;
            let value_len = read_u32(&mut buf, header.offset)? as usize;
            let value = read_bytes(&mut buf, value_len, header.offset)?;
            headers.push(Header { name, value });
        }

        Ok(Self {
            offset: header.offset,
            timestamp: header.timestamp,
            key,
            value,
            headers,
        })
    }
}

fn read_i32(buf: &mut &[u8], offset: i64) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated(offset));
    }
    Ok(buf.get_i32())
}

fn read_u32(buf: &mut &[u8], offset: i64) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(offset));
    }
    Ok(buf.get_u32())
}

fn read_bytes(buf: &mut &[u8], len: usize, offset: i64) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(truncated(offset));
    }
    Ok(buf.copy_to_bytes(len))
}

fn truncated(offset: i64) -> RillError {
    RillError::Corrupted(format!("truncated message payload at offset {offset}"))
}

/// The fixed-width portion of a message frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub offset: i64,
    pub timestamp: i64,
    pub crc: u32,
    pub size: u32,
}

impl FrameHeader {
    /// Parse a frame header from exactly [`FRAME_HEADER_LEN`] bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(RillError::Corrupted(
                "truncated message frame header".to_string(),
            ));
        }
        let offset = buf.get_i64();
        let timestamp = buf.get_i64();
        let crc = buf.get_u32();
        let size = buf.get_u32();
        if size > MAX_PAYLOAD_BYTES {
            return Err(RillError::Corrupted(format!(
                "implausible frame size {size} at offset {offset}"
            )));
        }
        Ok(Self {
            offset,
            timestamp,
            crc,
            size,
        })
    }

    /// Total frame length including the header.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.size as usize
    }
}

/// Position-independent description of one frame inside a message set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameInfo {
    pub offset: i64,
    pub timestamp: i64,
    pub len: usize,
}

/// Encode a batch of messages as one contiguous message set.
pub(crate) fn encode_message_set(messages: &[Message], buf: &mut BytesMut) -> Vec<FrameInfo> {
    let mut frames = Vec::with_capacity(messages.len());
    for message in messages {
        let len = message.encode(buf);
        frames.push(FrameInfo {
            offset: message.offset,
            timestamp: message.timestamp,
            len,
        });
    }
    frames
}

/// Walk a raw message set, validating frame structure and payload CRCs,
/// and return the frame descriptors. Used by the follower append path to
/// recover leader-assigned offsets from verbatim bytes.
pub(crate) fn scan_message_set(data: &[u8]) -> Result<Vec<FrameInfo>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let header = FrameHeader::decode(&data[pos..])?;
        let end = pos + header.frame_len();
        if end > data.len() {
            return Err(RillError::Corrupted(format!(
                "truncated message frame at offset {}",
                header.offset
            )));
        }
        let payload = &data[pos + FRAME_HEADER_LEN..end];
        let computed = crc32fast::hash(payload);
        if computed != header.crc {
            return Err(RillError::Corrupted(format!(
                "message CRC mismatch at offset {}: stored {:#010x}, computed {:#010x}",
                header.offset, header.crc, computed
            )));
        }
        frames.push(FrameInfo {
            offset: header.offset,
            timestamp: header.timestamp,
            len: header.frame_len(),
        });
        pos = end;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: &Message) -> Message {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        let header = FrameHeader::decode(&buf).unwrap();
        Message::decode(header, &buf[FRAME_HEADER_LEN..]).unwrap()
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut message = Message::with_key("user-42", "signed-up");
        message.offset = 7;
        message.timestamp = 1_700_000_000_000;
        let decoded = roundtrip(&message);
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_keyless_message() {
        let mut message = Message::new("no key here");
        message.offset = 0;
        message.timestamp = 1;
        let decoded = roundtrip(&message);
        assert_eq!(decoded.key, None);
        assert_eq!(decoded.value, Bytes::from("no key here"));
    }

    #[test]
    fn test_headers_roundtrip() {
        let mut message = Message::new("v").with_headers(vec![
            Header::new("trace-id", "abc123"),
            Header::new("source", "ingest"),
        ]);
        message.offset = 3;
        message.timestamp = 99;
        let decoded = roundtrip(&message);
        assert_eq!(decoded.headers.len(), 2);
        assert_eq!(decoded.headers[0].name, "trace-id");
        assert_eq!(decoded.headers[1].value, Bytes::from("ingest"));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut message = Message::new("payload");
        message.offset = 1;
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        // Flip a payload byte.
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let header = FrameHeader::decode(&buf).unwrap();
        let err = Message::decode(header, &buf[FRAME_HEADER_LEN..]).unwrap_err();
        assert!(matches!(err, RillError::Corrupted(_)));
    }

    #[test]
    fn test_scan_message_set() {
        let mut buf = BytesMut::new();
        let mut messages = Vec::new();
        for i in 0..3 {
            let mut m = Message::new(format!("value-{i}"));
            m.offset = 10 + i;
            m.timestamp = 1000 + i;
            messages.push(m);
        }
        encode_message_set(&messages, &mut buf);

        let frames = scan_message_set(&buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].offset, 10);
        assert_eq!(frames[2].offset, 12);
        assert_eq!(frames[1].timestamp, 1001);
        let total: usize = frames.iter().map(|f| f.len).sum();
        assert_eq!(total, buf.len());
    }

    #[test]
    fn test_scan_rejects_truncated_set() {
        let mut buf = BytesMut::new();
        let mut m = Message::new("value");
        m.offset = 0;
        m.encode(&mut buf);
        let err = scan_message_set(&buf[..buf.len() - 2]).unwrap_err();
        assert!(matches!(err, RillError::Corrupted(_)));
    }
}

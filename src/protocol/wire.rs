//! Binary frame codec for the membrane wire protocol.
//!
//! Every message between the server and a worker process is one frame:
//!
//! ```text
//! off 0-1  : magic 0x4D 0x42 ("MB")
//! off 2    : protocol version (0x01)
//! off 3    : frame type
//! off 4    : flags
//! off 5-6  : stream id        (u16, big-endian)
//! off 7-9  : headers length   (u24, big-endian)
//! off 10-13: payload length   (u32, big-endian)
//! off 14.. : headers bytes, then payload bytes
//! ```
//!
//! The encoder coalesces header, headers blob and payload into a single
//! buffer so each frame reaches the pipe in one write.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic bytes identifying a membrane wire frame.
pub const MAGIC: [u8; 2] = [0x4D, 0x42]; // "MB"

/// Current protocol version.
pub const VERSION: u8 = 0x01;

/// Fixed size of a frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 14;

/// Maximum size of the headers blob (u24).
pub const MAX_HEADERS_LEN: usize = (1 << 24) - 1;

/// Maximum size of the payload (u32).
pub const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64;

// Frame types.
pub const TYPE_REQUEST: u8 = 0x01; // server → worker: new HTTP request
pub const TYPE_RESPONSE: u8 = 0x02; // worker → server: HTTP response
pub const TYPE_STREAM_DATA: u8 = 0x03; // bidirectional: WebSocket frame
pub const TYPE_STREAM_CLOSE: u8 = 0x04; // either: close WebSocket connection
pub const TYPE_WORKER_READY: u8 = 0x05; // worker → server: worker is available
pub const TYPE_WORKER_STOP: u8 = 0x06; // server → worker: graceful shutdown
pub const TYPE_PING: u8 = 0x07; // health check (ping/pong)
pub const TYPE_ERROR: u8 = 0x08; // error reporting

// Frame flags.
pub const FLAG_COMPRESSED: u8 = 1 << 0;
pub const FLAG_CHUNKED: u8 = 1 << 1; // reserved
pub const FLAG_FINAL: u8 = 1 << 2; // reserved

/// Errors produced by the frame codec.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid magic bytes: {found:02x?}")]
    InvalidMagic { found: [u8; 2] },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("stream ended mid-frame")]
    ShortRead,

    #[error("headers blob too large: {len} bytes")]
    HeadersTooLarge { len: usize },

    #[error("payload too large: {len} bytes")]
    PayloadTooLarge { len: u64 },

    #[error("expected frame type 0x{expected:02x}, got 0x{found:02x}")]
    UnexpectedFrameType { expected: u8, found: u8 },

    #[error("encoding frame headers: {0}")]
    HeaderEncode(#[from] rmp_serde::encode::Error),

    #[error("decoding frame headers: {0}")]
    HeaderDecode(#[from] rmp_serde::decode::Error),

    #[error("frame I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A single membrane wire protocol frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u16,
    /// msgpack-encoded message headers.
    pub headers: Vec<u8>,
    /// Raw message payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a PING health check frame.
    pub fn ping() -> Self {
        Self {
            frame_type: TYPE_PING,
            payload: b"ping".to_vec(),
            ..Self::default()
        }
    }

    /// Create a PONG response frame.
    pub fn pong() -> Self {
        Self {
            frame_type: TYPE_PING,
            payload: b"pong".to_vec(),
            ..Self::default()
        }
    }

    /// Create a WORKER_READY signal frame.
    pub fn worker_ready() -> Self {
        Self {
            frame_type: TYPE_WORKER_READY,
            ..Self::default()
        }
    }

    /// Create a WORKER_STOP signal frame.
    pub fn worker_stop() -> Self {
        Self {
            frame_type: TYPE_WORKER_STOP,
            ..Self::default()
        }
    }

    /// Create an ERROR frame carrying a diagnostic message.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            frame_type: TYPE_ERROR,
            payload: msg.into().into_bytes(),
            ..Self::default()
        }
    }
}

/// Encode a frame into a single contiguous buffer.
pub fn encode_vec(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let hdr_len = frame.headers.len();
    if hdr_len > MAX_HEADERS_LEN {
        return Err(ProtocolError::HeadersTooLarge { len: hdr_len });
    }
    let payload_len = frame.payload.len() as u64;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge { len: payload_len });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + hdr_len + frame.payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.push(frame.frame_type);
    buf.push(frame.flags);
    buf.extend_from_slice(&frame.stream_id.to_be_bytes());
    buf.push((hdr_len >> 16) as u8);
    buf.push((hdr_len >> 8) as u8);
    buf.push(hdr_len as u8);
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.headers);
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Decode a frame header, returning (type, flags, stream_id, headers_len, payload_len).
fn decode_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<(u8, u8, u16, usize, usize), ProtocolError> {
    if header[0..2] != MAGIC {
        return Err(ProtocolError::InvalidMagic {
            found: [header[0], header[1]],
        });
    }
    if header[2] != VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[2]));
    }
    let stream_id = u16::from_be_bytes([header[5], header[6]]);
    let hdr_len = (header[7] as usize) << 16 | (header[8] as usize) << 8 | header[9] as usize;
    let payload_len = u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize;
    Ok((header[3], header[4], stream_id, hdr_len, payload_len))
}

fn split_body(mut data: Vec<u8>, hdr_len: usize) -> (Vec<u8>, Vec<u8>) {
    let payload = data.split_off(hdr_len);
    (data, payload)
}

fn eof_to_short_read(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ShortRead
    } else {
        ProtocolError::Io(e)
    }
}

/// Write a frame to an async writer as a single coalesced write.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_vec(frame)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read and decode one frame from an async reader.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut header).await.map_err(eof_to_short_read)?;
    let (frame_type, flags, stream_id, hdr_len, payload_len) = decode_header(&header)?;

    let mut data = vec![0u8; hdr_len + payload_len];
    if !data.is_empty() {
        r.read_exact(&mut data).await.map_err(eof_to_short_read)?;
    }
    let (headers, payload) = split_body(data, hdr_len);

    Ok(Frame {
        frame_type,
        flags,
        stream_id,
        headers,
        payload,
    })
}

/// Blocking variant of [`write_frame`] for plain `std::io` streams.
///
/// Used by worker-side processes that speak the protocol over stdin/stdout
/// without an async runtime.
pub fn write_frame_sync<W>(w: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: std::io::Write,
{
    let buf = encode_vec(frame)?;
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Blocking variant of [`read_frame`] for plain `std::io` streams.
pub fn read_frame_sync<R>(r: &mut R) -> Result<Frame, ProtocolError>
where
    R: std::io::Read,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut header).map_err(eof_to_short_read)?;
    let (frame_type, flags, stream_id, hdr_len, payload_len) = decode_header(&header)?;

    let mut data = vec![0u8; hdr_len + payload_len];
    if !data.is_empty() {
        r.read_exact(&mut data).map_err(eof_to_short_read)?;
    }
    let (headers, payload) = split_body(data, hdr_len);

    Ok(Frame {
        frame_type,
        flags,
        stream_id,
        headers,
        payload,
    })
}

/// Decode a frame from a byte slice.
pub fn decode_slice(mut buf: &[u8]) -> Result<Frame, ProtocolError> {
    read_frame_sync(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let buf = encode_vec(frame).expect("encode failed");
        decode_slice(&buf).expect("decode failed")
    }

    #[test]
    fn test_roundtrip_preserves_all_fields() {
        let frame = Frame {
            frame_type: TYPE_REQUEST,
            flags: FLAG_COMPRESSED | FLAG_FINAL,
            stream_id: 0xBEEF,
            headers: vec![1, 2, 3, 4, 5],
            payload: b"hello world".to_vec(),
        };
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn test_roundtrip_empty_frame() {
        let frame = Frame::worker_ready();
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.frame_type, TYPE_WORKER_READY);
        assert!(decoded.headers.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_roundtrip_one_megabyte_payload() {
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let frame = Frame {
            frame_type: TYPE_RESPONSE,
            payload: payload.clone(),
            ..Frame::default()
        };
        let decoded = roundtrip(&frame);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_encoded_frame_starts_with_magic_and_version() {
        let buf = encode_vec(&Frame::ping()).unwrap();
        assert_eq!(buf[0], 0x4D);
        assert_eq!(buf[1], 0x42);
        assert_eq!(buf[2], 0x01);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = encode_vec(&Frame::ping()).unwrap();
        buf[0] = 0xDE;
        buf[1] = 0xAD;
        match decode_slice(&buf) {
            Err(ProtocolError::InvalidMagic { found }) => assert_eq!(found, [0xDE, 0xAD]),
            other => panic!("expected InvalidMagic, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut buf = encode_vec(&Frame::ping()).unwrap();
        buf[2] = 0x02;
        assert!(matches!(
            decode_slice(&buf),
            Err(ProtocolError::UnsupportedVersion(0x02))
        ));
    }

    #[test]
    fn test_decode_truncated_frame_is_short_read() {
        let buf = encode_vec(&Frame {
            frame_type: TYPE_RESPONSE,
            payload: b"truncate me".to_vec(),
            ..Frame::default()
        })
        .unwrap();
        // Cut the frame mid-payload.
        assert!(matches!(
            decode_slice(&buf[..buf.len() - 4]),
            Err(ProtocolError::ShortRead)
        ));
        // Cut the frame mid-header.
        assert!(matches!(
            decode_slice(&buf[..7]),
            Err(ProtocolError::ShortRead)
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_headers() {
        let frame = Frame {
            frame_type: TYPE_REQUEST,
            headers: vec![0; MAX_HEADERS_LEN + 1],
            ..Frame::default()
        };
        assert!(matches!(
            encode_vec(&frame),
            Err(ProtocolError::HeadersTooLarge { .. })
        ));
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let frame = Frame {
            frame_type: TYPE_STREAM_DATA,
            flags: FLAG_CHUNKED,
            stream_id: 0x0102,
            headers: vec![0xAA; 3],
            payload: vec![0xBB; 7],
        };
        let buf = encode_vec(&frame).unwrap();
        assert_eq!(buf[3], TYPE_STREAM_DATA);
        assert_eq!(buf[4], FLAG_CHUNKED);
        assert_eq!(&buf[5..7], &[0x01, 0x02]);
        assert_eq!(&buf[7..10], &[0x00, 0x00, 0x03]);
        assert_eq!(&buf[10..14], &[0x00, 0x00, 0x00, 0x07]);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 3 + 7);
    }

    #[tokio::test]
    async fn test_async_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame {
            frame_type: TYPE_REQUEST,
            stream_id: 7,
            headers: vec![9, 9, 9],
            payload: b"over the wire".to_vec(),
            ..Frame::default()
        };
        write_frame(&mut client, &frame).await.unwrap();
        let decoded = read_frame(&mut server).await.unwrap();
        assert_eq!(decoded, frame);
    }
}

//! Typed messages carried inside wire frames.
//!
//! Message headers travel as msgpack maps (string-keyed, self-describing)
//! in the frame headers blob; bodies travel untouched in the payload.

use super::wire::{
    Frame, ProtocolError, TYPE_REQUEST, TYPE_RESPONSE, TYPE_STREAM_CLOSE, TYPE_STREAM_DATA,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stream event: a WebSocket connection was established.
pub const EVENT_CONNECT: &str = "connect";
/// Stream event: a WebSocket message arrived.
pub const EVENT_MESSAGE: &str = "message";
/// Stream event: a WebSocket connection went away.
pub const EVENT_CLOSE: &str = "close";

/// HTTP request metadata sent to workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHeaders {
    pub method: String,
    /// Request path only; the query string travels separately.
    pub uri: String,
    pub query_string: String,
    /// Case-preserved header names mapped to comma-joined values.
    pub headers: HashMap<String, String>,
    pub remote_addr: String,
    pub server_name: String,
    pub server_port: String,
    pub protocol: String,
}

/// HTTP response metadata returned by workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHeaders {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// WebSocket stream metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamHeaders {
    #[serde(rename = "conn_id")]
    pub connection_id: String,
    /// One of [`EVENT_CONNECT`], [`EVENT_MESSAGE`], [`EVENT_CLOSE`].
    pub event: String,
    pub room: String,
}

fn expect_type(frame: &Frame, expected: u8) -> Result<(), ProtocolError> {
    if frame.frame_type != expected {
        return Err(ProtocolError::UnexpectedFrameType {
            expected,
            found: frame.frame_type,
        });
    }
    Ok(())
}

/// Build a REQUEST frame from request metadata and body.
pub fn encode_request(headers: &RequestHeaders, body: Vec<u8>) -> Result<Frame, ProtocolError> {
    Ok(Frame {
        frame_type: TYPE_REQUEST,
        headers: rmp_serde::to_vec_named(headers)?,
        payload: body,
        ..Frame::default()
    })
}

/// Extract request metadata and body from a REQUEST frame.
pub fn decode_request(frame: Frame) -> Result<(RequestHeaders, Vec<u8>), ProtocolError> {
    expect_type(&frame, TYPE_REQUEST)?;
    let headers = rmp_serde::from_slice(&frame.headers)?;
    Ok((headers, frame.payload))
}

/// Build a RESPONSE frame from response metadata and body.
pub fn encode_response(headers: &ResponseHeaders, body: Vec<u8>) -> Result<Frame, ProtocolError> {
    Ok(Frame {
        frame_type: TYPE_RESPONSE,
        headers: rmp_serde::to_vec_named(headers)?,
        payload: body,
        ..Frame::default()
    })
}

/// Extract response metadata and body from a RESPONSE frame.
pub fn decode_response(frame: Frame) -> Result<(ResponseHeaders, Vec<u8>), ProtocolError> {
    expect_type(&frame, TYPE_RESPONSE)?;
    let headers = rmp_serde::from_slice(&frame.headers)?;
    Ok((headers, frame.payload))
}

/// Build a STREAM_DATA frame for WebSocket traffic.
pub fn encode_stream_data(
    stream_id: u16,
    headers: &StreamHeaders,
    data: Vec<u8>,
) -> Result<Frame, ProtocolError> {
    Ok(Frame {
        frame_type: TYPE_STREAM_DATA,
        stream_id,
        headers: rmp_serde::to_vec_named(headers)?,
        payload: data,
        ..Frame::default()
    })
}

/// Extract stream metadata and data from a STREAM_DATA frame.
pub fn decode_stream_data(frame: Frame) -> Result<(StreamHeaders, Vec<u8>), ProtocolError> {
    expect_type(&frame, TYPE_STREAM_DATA)?;
    let headers = rmp_serde::from_slice(&frame.headers)?;
    Ok((headers, frame.payload))
}

/// Build a STREAM_CLOSE frame for a connection.
pub fn encode_stream_close(stream_id: u16, connection_id: &str) -> Result<Frame, ProtocolError> {
    let headers = StreamHeaders {
        connection_id: connection_id.to_string(),
        event: EVENT_CLOSE.to_string(),
        room: String::new(),
    };
    Ok(Frame {
        frame_type: TYPE_STREAM_CLOSE,
        stream_id,
        headers: rmp_serde::to_vec_named(&headers)?,
        ..Frame::default()
    })
}

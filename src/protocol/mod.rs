//! Wire protocol between the server and worker processes.
//!
//! The protocol is frame-based: a fixed 14-byte header followed by a
//! msgpack headers blob and a raw payload. [`wire`] owns the byte layout;
//! [`message`] builds the typed messages (requests, responses, stream
//! events) on top of it.

pub mod message;
pub mod wire;

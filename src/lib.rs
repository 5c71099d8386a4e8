//! membrane - PHP application server.
//!
//! Accepts HTTP(S) requests and dispatches each to one of a pool of
//! long-lived PHP worker processes over a length-prefixed binary framing
//! protocol on per-worker pipes. The pool supervises its fleet: it
//! recycles workers by job count, replaces the dead, auto-scales against
//! the observed busy ratio, and reloads with zero downtime when signalled.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod websocket;

pub use error::{MembraneError, Result};

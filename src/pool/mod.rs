//! Worker pool: process supervision, request dispatch, and reload.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │   HTTP front-end │
//!                  └────────┬─────────┘
//!                           │ exec()
//!                  ┌────────▼─────────┐      ┌───────────────┐
//!                  │  Pool scheduler  │◄─────┤  File watcher │
//!                  └────────┬─────────┘      └───────────────┘
//!            ┌──────────────┼──────────────┐
//!      ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!      │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!      │ (php proc)│  │ (php proc)│  │ (php proc)│
//!      └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers are external processes speaking the wire protocol over their
//! standard streams. Idle workers park in a bounded FIFO queue; the
//! scheduler enforces allocate and request deadlines, recycles workers by
//! job count, replaces the dead, auto-scales against the busy ratio, and
//! reloads the fleet without dropping traffic.

mod pool;
mod watcher;
mod worker;

pub use pool::{Pool, PoolStats};
pub use watcher::{ChangeHandler, Watcher};
pub use worker::{TurnOutcome, TurnReply, Worker, WorkerState, STOP_GRACE};

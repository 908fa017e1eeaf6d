//! Asynchronous flavor of the driver, driven by the tokio waiter.
//!
//! Mirrors the blocking API one to one: the same session state and the
//! same protocol machines run every exchange, only the sleeps between
//! resumptions yield to the runtime instead of parking the thread. A
//! transport scripted the same way produces the same command sequence
//! under either flavor.
//!
//! Streaming values cannot pump the socket from `drop`, so [`RowStream`],
//! [`Copy`] and [`ServerCursor`] must be finished explicitly; dropping one
//! unfinished closes the connection instead of leaving the protocol in the
//! middle of an exchange.

mod connection;
mod cursor;

pub use crate::session::{ExecuteOptions, IsolationLevel};
pub use connection::Connection;
pub use cursor::{Copy, Cursor, RowStream, ServerCursor};

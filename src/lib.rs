//! A non-blocking PostgreSQL driver core built on resumable state machines.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: every protocol exchange is a [`machine::Machine`]
//!   that suspends with the socket interest it needs instead of blocking
//! - **Pluggable waiting**: drive machines with the built-in blocking waiter,
//!   the tokio waiter, or your own event loop
//! - **Full driver surface**: transactions, pipeline mode, COPY, streaming
//!   results, LISTEN/NOTIFY, two-phase commit and automatic statement
//!   preparation
//!
//! # Example
//!
//! ```no_run
//! use pump_postgres::{Connection, Result};
//! # use pump_postgres::transport::lab::LabTransport as Pq;
//!
//! fn main() -> Result<()> {
//!     let mut conn = Connection::<Pq>::connect("postgres://localhost/mydb")?;
//!     let mut cursor = conn.cursor();
//!     cursor.execute("SELECT id, name FROM users WHERE id = $1", &[&1_i32])?;
//!     for row in cursor.rows()? {
//!         println!("{}", row.get_by_name::<String>("name")?);
//!     }
//!     conn.commit()?;
//!     Ok(())
//! }
//! ```

pub mod adapt;
pub mod conninfo;
pub mod error;
pub mod machine;
pub mod prepare;
pub mod tpc;
pub mod transport;
pub mod waiting;
pub mod wire;

mod pipeline;
mod session;

#[cfg(feature = "sync")]
pub mod connection;
#[cfg(feature = "sync")]
pub mod cursor;
#[cfg(feature = "tokio")]
pub mod tokio;

pub use adapt::{FromField, Param, Row, ToParam};
pub use conninfo::Conninfo;
pub use error::{Error, ErrorKind, Result, ServerError};
pub use machine::{Machine, Ready, Step, Wait};
pub use session::IsolationLevel;
pub use transport::{
    ExecStatus, Format, Notify, Oid, PqResult, TransactionStatus, Transport,
};

#[cfg(feature = "sync")]
pub use connection::Connection;
#[cfg(feature = "sync")]
pub use cursor::{Copy, Cursor, ExecuteOptions, RowStream, ServerCursor};

//! Transport handle contract.
//!
//! The driver core does not speak the message grammar itself; it drives an
//! opaque non-blocking handle that already does (a libpq-equivalent). This
//! module defines that contract and the value types that cross it. The
//! [`lab`] submodule provides a scripted in-memory implementation for tests.

pub mod lab;

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::adapt::Param;
use crate::error::{Error, Result, ServerError};

/// PostgreSQL Object Identifier (OID)
pub type Oid = u32;

/// Data format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Format {
    /// Text format (human-readable)
    #[default]
    Text = 0,
    /// Binary format (type-specific packed representation)
    Binary = 1,
}

/// Connection status of a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Handshake complete, connection usable.
    Ok,
    /// Connection failed or was lost.
    Bad,
    /// Any of the in-progress handshake substates.
    Connecting,
}

/// Result of polling an asynchronous connect (or cancel) handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Wait for the socket to become readable, then poll again.
    Reading,
    /// Wait for the socket to become writable, then poll again.
    Writing,
    /// Handshake finished successfully.
    Ok,
    /// Handshake failed.
    Failed,
}

/// Transaction status, tracked from server responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// A command is in flight.
    Active,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; only ROLLBACK will be accepted.
    InError,
    /// Connection broken or status unknown.
    Unknown,
}

/// Status tag of one server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Command completed, no rows (e.g. INSERT without RETURNING).
    CommandOk,
    /// Command completed with a (possibly empty) row set.
    TuplesOk,
    /// Server is ready to receive COPY FROM STDIN data.
    CopyIn,
    /// Server is about to send COPY TO STDOUT data.
    CopyOut,
    /// The server reported an error.
    FatalError,
    /// The submitted query string was empty.
    EmptyQuery,
    /// Pipeline synchronization point.
    PipelineSync,
    /// Command skipped because an earlier pipeline command failed.
    PipelineAborted,
    /// One row of a single-row-mode result.
    SingleTuple,
    /// A chunk of rows of a chunked-rows-mode result.
    TuplesChunk,
}

impl ExecStatus {
    /// True for the statuses that open a COPY sub-protocol.
    pub fn is_copy(self) -> bool {
        matches!(self, ExecStatus::CopyIn | ExecStatus::CopyOut)
    }

    /// True when the command succeeded (with or without rows).
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ExecStatus::CommandOk
                | ExecStatus::TuplesOk
                | ExecStatus::SingleTuple
                | ExecStatus::TuplesChunk
                | ExecStatus::EmptyQuery
        )
    }
}

/// One result column descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: Oid,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Type size (-1 for variable length)
    pub type_size: i16,
    /// Format of the values of this column
    pub format: Format,
}

/// Shared column descriptors; attached to many rows without cloning.
pub type SharedColumns = Arc<Vec<ColumnDescription>>;

/// One server response to a command.
#[derive(Debug, Clone)]
pub struct PqResult {
    /// Status tag
    pub status: ExecStatus,
    /// Command tag, e.g. `INSERT 0 1` (absent for errors)
    pub command_tag: Option<String>,
    /// Column descriptors (empty when the command returns no rows)
    pub columns: SharedColumns,
    /// Raw row data; `None` fields are SQL NULL
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    /// Server diagnostics for `FatalError` results
    pub error: Option<ServerError>,
}

impl PqResult {
    /// Build a bare result with only a status.
    pub fn with_status(status: ExecStatus) -> Self {
        Self {
            status,
            command_tag: None,
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            error: None,
        }
    }

    /// Rows affected, parsed from the trailing number of the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        let tag = self.command_tag.as_deref()?;
        tag.rsplit(' ').next()?.parse().ok()
    }

    /// Convert a `FatalError` result into the error it carries.
    ///
    /// Falls back to a generic operational error when the transport lost the
    /// diagnostic fields.
    pub fn into_error(self) -> Error {
        match self.error {
            Some(fields) => Error::Server(fields),
            None => Error::Operational("server reported an error without diagnostics".into()),
        }
    }
}

/// A buffered asynchronous notification (LISTEN/NOTIFY).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// Channel name
    pub channel: String,
    /// Notification payload
    pub payload: String,
    /// PID of the notifying backend process
    pub backend_pid: u32,
}

/// Outcome of a non-blocking flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// All buffered bytes were written.
    Done,
    /// Output remains; wait for writability and flush again.
    Pending,
}

/// Outcome of a non-blocking attempt to read one COPY OUT chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutChunk {
    /// No data available yet; wait for readability.
    WouldBlock,
    /// One chunk of copy data.
    Data(Vec<u8>),
    /// End of copy data; fetch the final result next.
    Done,
}

/// Outcome of a non-blocking attempt to queue COPY IN data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// The data was queued.
    Queued,
    /// Zero bytes accepted; wait for writability and retry.
    WouldBlock,
}

/// Anything the waiters can poll: it exposes a socket descriptor.
///
/// The descriptor is re-read on every resumption because it can change
/// mid-operation (SSL negotiation, retrying another host).
pub trait Socketed {
    /// The file descriptor to poll for readiness.
    fn socket(&self) -> Result<RawFd>;
}

/// A server-side cancellation request, independent of the primary handle.
pub trait CancelRequest: Socketed {
    /// Issue the cancel request, blocking until delivered.
    fn cancel_blocking(&mut self) -> Result<()>;

    /// Begin a non-blocking cancel handshake.
    fn start(&mut self) -> Result<()>;

    /// Advance the non-blocking cancel handshake.
    fn poll(&mut self) -> Result<PollingStatus>;
}

/// The opaque non-blocking protocol handle the driver core pumps.
///
/// Implementations already speak the frontend/backend message grammar
/// (simple and extended query, COPY, pipeline framing) and surface it
/// through these non-blocking primitives.
pub trait Transport: Socketed + Sized {
    /// The cancellation handle type produced by [`Transport::cancel_conn`].
    type Cancel: CancelRequest;

    /// Begin an asynchronous connection attempt from resolved parameters.
    fn connect_start(params: &[(String, String)]) -> Result<Self>;

    /// Advance the connection handshake.
    fn connect_poll(&mut self) -> Result<PollingStatus>;

    /// Current connection status.
    fn status(&self) -> ConnStatus;

    /// Current transaction status.
    fn transaction_status(&self) -> TransactionStatus;

    /// Server version number, e.g. 170002.
    fn server_version(&self) -> u32;

    /// Backend process id of the connected session.
    fn backend_pid(&self) -> u32;

    /// Last transport-level error message.
    fn error_message(&self) -> String;

    /// Submit a statement through the simple query sub-protocol.
    fn send_query(&mut self, sql: &str) -> Result<()>;

    /// Submit a statement through the extended sub-protocol with parameters.
    fn send_query_params(
        &mut self,
        sql: &str,
        params: &[Param],
        result_format: Format,
    ) -> Result<()>;

    /// Parse a statement under a server-side name.
    fn send_prepare(&mut self, name: &str, sql: &str, param_oids: &[Oid]) -> Result<()>;

    /// Bind and execute a previously prepared statement.
    fn send_query_prepared(
        &mut self,
        name: &str,
        params: &[Param],
        result_format: Format,
    ) -> Result<()>;

    /// Close a server-side prepared statement (protocol-level, no SQL).
    fn send_close_prepared(&mut self, name: &str) -> Result<()>;

    /// Deliver results of the current query one row at a time.
    fn set_single_row_mode(&mut self) -> Result<()>;

    /// Deliver results of the current query in chunks of up to `size` rows.
    fn set_chunked_rows_mode(&mut self, size: usize) -> Result<()>;

    /// Whether the installed transport supports chunked-rows mode.
    fn supports_chunked_rows(&self) -> bool {
        false
    }

    /// Whether the installed transport supports non-blocking cancellation.
    fn supports_cancel_safe(&self) -> bool {
        false
    }

    /// Flush buffered output without blocking.
    fn flush(&mut self) -> Result<FlushStatus>;

    /// Consume whatever input is available without blocking.
    fn consume_input(&mut self) -> Result<()>;

    /// True while more input is needed before `get_result` can answer.
    fn is_busy(&self) -> bool;

    /// Next parsed result, or `None` when the current exchange is drained.
    fn get_result(&mut self) -> Result<Option<PqResult>>;

    /// Non-blocking read of the next COPY OUT chunk.
    fn get_copy_data(&mut self) -> Result<CopyOutChunk>;

    /// Non-blocking write of COPY IN data.
    fn put_copy_data(&mut self, data: &[u8]) -> Result<PutStatus>;

    /// Finish COPY IN, optionally aborting it with an error message.
    fn put_copy_end(&mut self, error: Option<&str>) -> Result<PutStatus>;

    /// Enter pipeline mode.
    fn enter_pipeline_mode(&mut self) -> Result<()>;

    /// Exit pipeline mode; fails while results remain queued.
    fn exit_pipeline_mode(&mut self) -> Result<()>;

    /// Queue a pipeline synchronization point.
    fn pipeline_sync(&mut self) -> Result<()>;

    /// Queue a flush request so the server answers without a sync.
    fn send_flush_request(&mut self) -> Result<()>;

    /// Pop one buffered notification, if any.
    fn take_notify(&mut self) -> Option<Notify>;

    /// Create an out-of-band cancellation handle for this session.
    fn cancel_conn(&self) -> Result<Self::Cancel>;

    /// Release the underlying socket. Called at most once.
    fn finish(&mut self);
}

//! Session bookkeeping shared by the blocking and tokio connection
//! façades.
//!
//! Everything here is pure state and SQL building; the façades add the
//! transport and the waiter. Keeping one [`SessionCore`] behind both
//! flavors guarantees they issue the same commands in the same order.

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use crate::error::{Error, Result};
use crate::pipeline::PipelineState;
use crate::prepare::PrepareManager;
use crate::transport::{ExecStatus, Notify, PqResult, TransactionStatus};

/// Server version from which prepared statements are closed at the
/// protocol level instead of with DEALLOCATE.
pub(crate) const CLOSE_PREPARED_VERSION: u32 = 170000;

/// Rows per network round-trip when the transport supports chunked mode.
pub(crate) const STREAM_CHUNK_ROWS: usize = 128;

/// Bytes buffered before a COPY FROM STDIN chunk is pushed out.
pub(crate) const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Per-statement execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Force (`Some(true)`) or forbid (`Some(false)`) server-side
    /// preparation for this statement; `None` follows the connection's
    /// prepare threshold.
    pub prepare: Option<bool>,
    /// Request results in the binary format.
    pub binary: bool,
}

impl ExecuteOptions {
    pub fn prepared(mut self, prepare: bool) -> Self {
        self.prepare = Some(prepare);
        self
    }

    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }
}

const DEFAULT_PREPARE_THRESHOLD: usize = 5;
const DEFAULT_PREPARED_MAX: usize = 100;

/// SQL transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

pub(crate) struct TpcState {
    pub xid: crate::tpc::Xid,
    pub prepared: bool,
}

pub(crate) type NotifyHandler = Box<dyn FnMut(&Notify)>;

pub(crate) fn closed() -> Error {
    Error::Operational("the connection is closed".into())
}

/// Per-session state independent of transport and waiter.
pub(crate) struct SessionCore {
    pub autocommit: bool,
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
    begin_cache: Option<String>,
    pub begin_pending: bool,
    pub tx_depth: usize,
    pub prepare: PrepareManager,
    pub pipeline: Option<PipelineState>,
    pub pipeline_depth: usize,
    pub tpc: Option<TpcState>,
    pub notify_backlog: VecDeque<Notify>,
    pub notify_handlers: Vec<NotifyHandler>,
}

impl SessionCore {
    pub fn new() -> Self {
        Self {
            autocommit: false,
            isolation_level: None,
            read_only: None,
            deferrable: None,
            begin_cache: None,
            begin_pending: false,
            tx_depth: 0,
            prepare: PrepareManager::new(
                Some(DEFAULT_PREPARE_THRESHOLD),
                NonZeroUsize::new(DEFAULT_PREPARED_MAX).unwrap_or(NonZeroUsize::MIN),
            ),
            pipeline: None,
            pipeline_depth: 0,
            tpc: None,
            notify_backlog: VecDeque::new(),
            notify_handlers: Vec::new(),
        }
    }

    /// Drop the cached BEGIN statement after a setting change.
    pub fn invalidate_begin(&mut self) {
        self.begin_cache = None;
    }

    pub fn begin_statement(&mut self) -> String {
        if let Some(cached) = &self.begin_cache {
            return cached.clone();
        }
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation_level {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        match self.read_only {
            Some(true) => sql.push_str(" READ ONLY"),
            Some(false) => sql.push_str(" READ WRITE"),
            None => {}
        }
        match self.deferrable {
            Some(true) => sql.push_str(" DEFERRABLE"),
            Some(false) => sql.push_str(" NOT DEFERRABLE"),
            None => {}
        }
        self.begin_cache = Some(sql.clone());
        sql
    }

    /// Session settings may only change while nothing is in progress.
    pub fn ensure_settable(&self, what: &str, status: TransactionStatus) -> Result<()> {
        if self.pipeline.is_some() {
            return Err(Error::Programming(format!(
                "couldn't change {what} with an active pipeline"
            )));
        }
        match status {
            TransactionStatus::Idle => Ok(()),
            status => Err(Error::Programming(format!(
                "couldn't change {what} in state {status:?}"
            ))),
        }
    }

    /// Bare commit/rollback is refused inside scoped blocks and during a
    /// two-phase transaction.
    pub fn ensure_finishable(&self, what: &str) -> Result<()> {
        if self.tx_depth > 0 {
            return Err(Error::Programming(format!(
                "{what}() cannot be used inside a transaction() block"
            )));
        }
        if let Some(tpc) = &self.tpc {
            if tpc.prepared {
                return Err(Error::Programming(format!(
                    "{what}() cannot be used after tpc_prepare()"
                )));
            }
            return Err(Error::Programming(format!(
                "{what}() cannot be used during a two-phase transaction, \
                 use tpc_commit() or tpc_rollback()"
            )));
        }
        Ok(())
    }

    /// React to commands that destroyed server state behind our back.
    ///
    /// A user-issued DEALLOCATE ALL or DISCARD ALL already dropped our
    /// prepared statements server-side; the bookkeeping is dropped without
    /// queuing deallocations for names that no longer exist.
    pub fn note_destructive_tags(&mut self, results: &[PqResult]) {
        for result in results {
            if let Some(tag) = result.command_tag.as_deref()
                && matches!(tag, "DEALLOCATE ALL" | "DISCARD ALL")
            {
                self.prepare.reset();
            }
        }
    }

    /// Run the handlers for one notification and park it in the backlog.
    pub fn dispatch_notify(&mut self, notify: Notify) {
        for handler in &mut self.notify_handlers {
            handler(&notify);
        }
        self.notify_backlog.push_back(notify);
    }
}

/// A cursor's adopted results and its position in them.
///
/// Screening and walking results is the same in both façades; only the
/// pumping that produces them differs.
#[derive(Default)]
pub(crate) struct ResultSet {
    pub results: Vec<PqResult>,
    pub index: usize,
    pub row: usize,
}

impl ResultSet {
    pub fn clear(&mut self) {
        self.results.clear();
        self.index = 0;
        self.row = 0;
    }

    /// Validate one logical result batch before it is adopted.
    ///
    /// Zero results is an internal error, a fatal result is raised with its
    /// diagnostics, and a COPY status means the caller used the wrong
    /// operation.
    pub fn screen(
        core: &mut SessionCore,
        mut results: Vec<PqResult>,
    ) -> Result<Vec<PqResult>> {
        if results.is_empty() {
            return Err(Error::Internal("the query returned no result".into()));
        }
        if let Some(failed) = results
            .iter()
            .position(|res| res.status == ExecStatus::FatalError)
        {
            return Err(results.swap_remove(failed).into_error());
        }
        if results.iter().any(|res| res.status.is_copy()) {
            return Err(Error::Programming(
                "COPY cannot be run with execute(); use copy() instead".into(),
            ));
        }
        core.note_destructive_tags(&results);
        Ok(results)
    }

    pub fn adopt(&mut self, results: Vec<PqResult>) {
        self.results = results;
        self.index = 0;
        self.row = 0;
    }

    pub fn current(&self) -> Option<&PqResult> {
        self.results.get(self.index)
    }

    /// The current result, which must carry rows.
    pub fn verified_mut(&mut self) -> Result<&mut PqResult> {
        let Some(result) = self.results.get_mut(self.index) else {
            return Err(Error::Interface(
                "no result available; execute() a query first".into(),
            ));
        };
        match result.status {
            ExecStatus::TuplesOk | ExecStatus::SingleTuple | ExecStatus::TuplesChunk => {
                Ok(result)
            }
            _ => Err(Error::Programming(
                "the last operation didn't produce rows".into(),
            )),
        }
    }

    pub fn nextset(&mut self) -> bool {
        if self.index + 1 < self.results.len() {
            self.index += 1;
            self.row = 0;
            true
        } else {
            false
        }
    }

    pub fn rowcount(&self) -> i64 {
        let Some(result) = self.current() else {
            return -1;
        };
        let count = match result.status {
            ExecStatus::TuplesOk => Some(result.rows.len() as u64),
            ExecStatus::CommandOk => result.rows_affected(),
            _ => None,
        };
        count.and_then(|n| i64::try_from(n).ok()).unwrap_or(-1)
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

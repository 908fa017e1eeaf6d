//! Asynchronous cursors.
//!
//! The same result-set walking as the blocking flavor, with one difference
//! forced by the language: `Drop` cannot await, so an unexhausted
//! [`RowStream`] or unfinished [`Copy`] must be wound down explicitly with
//! its `close()` or `finish()` method. Dropping one mid-exchange logs a
//! warning and closes the connection, since the protocol state can no
//! longer be recovered without awaiting.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use memchr::memchr;
use tracing::warn;

use crate::adapt::{rows_from_result, serialize_params, Row, ToParam};
use crate::error::{Error, Result};
use crate::machine::{CopyEnd, CopyIn, CopyOut, CopyOutput, Execute, Fetch, QueuedCommand};
use crate::prepare::{Decision, StatementKey};
use crate::session::{
    quote_ident, quote_literal, ExecuteOptions, ResultSet, COPY_BUFFER_SIZE, STREAM_CHUNK_ROWS,
};
use crate::transport::{ColumnDescription, ExecStatus, Format, Oid, PqResult, Transport};
use crate::wire;

use super::Connection;

/// Runs statements and iterates their results.
pub struct Cursor<'c, C: Transport> {
    conn: &'c mut Connection<C>,
    set: ResultSet,
    pending_ticket: Option<usize>,
    closed: bool,
}

impl<'c, C: Transport> Cursor<'c, C> {
    pub(crate) fn new(conn: &'c mut Connection<C>) -> Self {
        Self {
            conn,
            set: ResultSet::default(),
            pending_ticket: None,
            closed: false,
        }
    }

    /// Mark the cursor unusable. Safe to call more than once.
    pub fn close(&mut self) {
        self.closed = true;
        self.set.clear();
        self.pending_ticket = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Interface("the cursor is closed".into()));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.set.clear();
        self.pending_ticket = None;
    }

    /// Run a statement with default options.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[&dyn ToParam],
    ) -> Result<&mut Self> {
        self.execute_with(sql, params, &ExecuteOptions::default())
            .await
    }

    /// Run a statement.
    ///
    /// With an active pipeline the statement is queued and its results are
    /// redeemed lazily on first access; otherwise results are fetched
    /// before returning.
    pub async fn execute_with(
        &mut self,
        sql: &str,
        params: &[&dyn ToParam],
        options: &ExecuteOptions,
    ) -> Result<&mut Self> {
        self.ensure_open()?;
        self.reset();
        let params = serialize_params(params);
        self.conn.run_maintenance().await?;
        self.conn.ensure_transaction().await?;
        let types: Vec<Oid> = params.iter().map(|p| p.oid).collect();
        let key = StatementKey::new(sql, types.clone());
        let decision = match options.prepare {
            Some(false) => Decision::No,
            Some(true) => self.conn.session.prepare.force(&key),
            None => self.conn.session.prepare.get(&key),
        };
        let result_format = if options.binary {
            Format::Binary
        } else {
            Format::Text
        };

        if self.conn.pipeline_active() {
            let ticket = match &decision {
                Decision::No => self.conn.pipeline_enqueue(
                    QueuedCommand::QueryParams {
                        sql: sql.into(),
                        params,
                        result_format,
                    },
                    None,
                    true,
                )?,
                Decision::Yes(name) => self.conn.pipeline_enqueue(
                    QueuedCommand::QueryPrepared {
                        name: name.clone(),
                        params,
                        result_format,
                    },
                    None,
                    true,
                )?,
                Decision::Should(name) => {
                    self.conn.pipeline_enqueue(
                        QueuedCommand::Prepare {
                            name: name.clone(),
                            sql: sql.into(),
                            param_oids: types,
                        },
                        Some((key, name.clone())),
                        false,
                    )?;
                    self.conn.pipeline_enqueue(
                        QueuedCommand::QueryPrepared {
                            name: name.clone(),
                            params,
                            result_format,
                        },
                        None,
                        true,
                    )?
                }
            };
            self.pending_ticket = ticket;
            return Ok(self);
        }

        match &decision {
            Decision::No => {
                let transport = self.conn.transport_mut()?;
                if params.is_empty() && !options.binary {
                    transport.send_query(sql)?;
                } else {
                    transport.send_query_params(sql, &params, result_format)?;
                }
            }
            Decision::Should(name) => {
                self.conn.transport_mut()?.send_prepare(name, sql, &types)?;
                let mut machine = Execute::new();
                let results = self.conn.pump(&mut machine).await?;
                if let Some(failed) = results
                    .into_iter()
                    .find(|res| res.status == ExecStatus::FatalError)
                {
                    return Err(failed.into_error());
                }
                self.conn
                    .transport_mut()?
                    .send_query_prepared(name, &params, result_format)?;
            }
            Decision::Yes(name) => {
                self.conn
                    .transport_mut()?
                    .send_query_prepared(name, &params, result_format)?;
            }
        }
        let mut machine = Execute::new();
        let results = self.conn.pump(&mut machine).await?;
        let results = ResultSet::screen(&mut self.conn.session, results)?;
        // Multi-statement strings cannot be prepared; only register
        // statements that produced exactly one result.
        let single = results.len() == 1;
        self.set.adopt(results);
        if single {
            self.conn.session.prepare.seen(key, &decision);
        }
        Ok(self)
    }

    /// Run the same statement once per parameter sequence.
    ///
    /// Returns the total number of affected rows across all executions.
    /// With `returning`, every execution's results are kept and walked with
    /// the fetch methods and [`Cursor::nextset`]; otherwise only the last
    /// one is. Under an active pipeline all executions are queued first and
    /// answered by a single drain.
    pub async fn executemany(
        &mut self,
        sql: &str,
        param_seqs: &[&[&dyn ToParam]],
        returning: bool,
    ) -> Result<u64> {
        self.ensure_open()?;
        let mut affected = 0;
        let mut kept: Vec<PqResult> = Vec::new();
        if self.conn.pipeline_active() {
            let mut tickets = Vec::with_capacity(param_seqs.len());
            for params in param_seqs {
                self.execute(sql, params).await?;
                if let Some(ticket) = self.pending_ticket.take() {
                    tickets.push(ticket);
                }
            }
            for group in self.conn.pipeline_fetch_batch(&tickets).await? {
                let results = ResultSet::screen(&mut self.conn.session, group)?;
                affected += results
                    .first()
                    .and_then(|res| res.rows_affected())
                    .unwrap_or(0);
                if returning {
                    kept.extend(results);
                } else {
                    kept = results;
                }
            }
        } else {
            for params in param_seqs {
                self.execute(sql, params).await?;
                affected += self
                    .set
                    .current()
                    .and_then(|res| res.rows_affected())
                    .unwrap_or(0);
                if returning {
                    kept.append(&mut self.set.results);
                } else {
                    kept = mem::take(&mut self.set.results);
                }
            }
        }
        self.set.adopt(kept);
        Ok(affected)
    }

    /// Redeem the pipeline ticket of the last queued execution, if any.
    async fn ensure_results(&mut self) -> Result<()> {
        if let Some(ticket) = self.pending_ticket.take() {
            let results = self.conn.pipeline_fetch(ticket).await?;
            let results = ResultSet::screen(&mut self.conn.session, results)?;
            self.set.adopt(results);
        }
        Ok(())
    }

    /// The next row of the current result set, or `None` when exhausted.
    pub async fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.ensure_results().await?;
        let index = self.set.row;
        let result = self.set.verified_mut()?;
        if index >= result.rows.len() {
            return Ok(None);
        }
        let values = mem::take(&mut result.rows[index]);
        let columns = Arc::clone(&result.columns);
        self.set.row += 1;
        Ok(Some(Row::new(columns, values)))
    }

    /// Up to `n` rows from the current result set.
    pub async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            match self.fetch_one().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// All remaining rows of the current result set.
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.ensure_results().await?;
        let index = self.set.row;
        let result = self.set.verified_mut()?;
        let tail = result.rows.split_off(index.min(result.rows.len()));
        let columns = Arc::clone(&result.columns);
        self.set.row = result.rows.len();
        Ok(rows_from_result(&columns, tail))
    }

    /// Advance to the next result set of a multi-statement execution.
    pub async fn nextset(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_results().await?;
        Ok(self.set.nextset())
    }

    /// Column descriptors of the current result set, if it has any.
    pub async fn description(&mut self) -> Result<Option<&[ColumnDescription]>> {
        self.ensure_open()?;
        self.ensure_results().await?;
        Ok(self
            .set
            .current()
            .filter(|res| !res.columns.is_empty())
            .map(|res| res.columns.as_slice()))
    }

    /// Rows returned by a query, or affected by a command; `-1` when the
    /// command does not report a count.
    pub async fn rowcount(&mut self) -> Result<i64> {
        self.ensure_open()?;
        self.ensure_results().await?;
        Ok(self.set.rowcount())
    }

    /// Run a query and stream its rows without buffering the whole set.
    ///
    /// Always goes through the extended sub-protocol, so the row mode
    /// request cannot race a multi-statement string. Uses chunked-rows
    /// mode when the transport supports it, single-row mode otherwise.
    pub async fn stream(
        &mut self,
        sql: &str,
        params: &[&dyn ToParam],
    ) -> Result<RowStream<'_, 'c, C>> {
        self.ensure_open()?;
        if self.conn.pipeline_active() {
            return Err(Error::Programming(
                "streaming cannot be used in pipeline mode".into(),
            ));
        }
        self.reset();
        let params = serialize_params(params);
        self.conn.run_maintenance().await?;
        self.conn.ensure_transaction().await?;
        {
            let transport = self.conn.transport_mut()?;
            transport.send_query_params(sql, &params, Format::Text)?;
            if transport.supports_chunked_rows() {
                transport.set_chunked_rows_mode(STREAM_CHUNK_ROWS)?;
            } else {
                transport.set_single_row_mode()?;
            }
        }
        let mut send = crate::machine::Send::new();
        self.conn.pump(&mut send).await?;
        Ok(RowStream {
            cursor: self,
            buffer: VecDeque::new(),
            done: false,
        })
    }

    /// Open a COPY sub-protocol for `sql`, which must be a single COPY
    /// statement.
    pub async fn copy(
        &mut self,
        sql: &str,
        params: &[&dyn ToParam],
    ) -> Result<Copy<'_, 'c, C>> {
        self.ensure_open()?;
        if self.conn.pipeline_active() {
            return Err(Error::NotSupported(
                "COPY cannot be used in pipeline mode".into(),
            ));
        }
        self.reset();
        let params = serialize_params(params);
        self.conn.run_maintenance().await?;
        self.conn.ensure_transaction().await?;
        {
            let transport = self.conn.transport_mut()?;
            if params.is_empty() {
                transport.send_query(sql)?;
            } else {
                transport.send_query_params(sql, &params, Format::Text)?;
            }
        }
        // The fetch stops on the result that opens the sub-protocol.
        let mut machine = Execute::new();
        let mut results = self.conn.pump(&mut machine).await?;
        if let Some(failed) = results
            .iter()
            .position(|res| res.status == ExecStatus::FatalError)
        {
            return Err(results.swap_remove(failed).into_error());
        }
        let result = match results.len() {
            0 => return Err(Error::Internal("the query returned no result".into())),
            1 => results.remove(0),
            _ => {
                return Err(Error::Programming(
                    "copy() expects a single COPY statement".into(),
                ))
            }
        };
        let direction = match result.status {
            ExecStatus::CopyIn => CopyDirection::In,
            ExecStatus::CopyOut => CopyDirection::Out,
            _ => {
                return Err(Error::Programming(
                    "copy() can only run COPY statements; use execute()".into(),
                ))
            }
        };
        Ok(Copy {
            cursor: self,
            direction,
            buffer: Vec::new(),
            pending: Vec::new(),
            binary: false,
            finished: false,
        })
    }
}

/// Streams the rows of one query as they arrive.
///
/// Call [`RowStream::close`] to abandon the stream early; dropping an
/// unexhausted stream closes the connection, because the leftover protocol
/// state cannot be drained without awaiting.
pub struct RowStream<'a, 'c, C: Transport> {
    cursor: &'a mut Cursor<'c, C>,
    buffer: VecDeque<Row>,
    done: bool,
}

impl<C: Transport> RowStream<'_, '_, C> {
    /// The next row, or `None` when the query is exhausted.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            let mut machine = Fetch::new();
            let fetched = match self.cursor.conn.pump(&mut machine).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };
            let Some(result) = fetched else {
                self.done = true;
                return None;
            };
            match result.status {
                ExecStatus::SingleTuple | ExecStatus::TuplesChunk => {
                    let columns = Arc::clone(&result.columns);
                    self.buffer
                        .extend(rows_from_result(&columns, result.rows));
                }
                // The terminal result of the streamed statement; loop on to
                // drain the exchange.
                ExecStatus::TuplesOk | ExecStatus::CommandOk | ExecStatus::EmptyQuery => {}
                ExecStatus::FatalError => {
                    self.done = true;
                    return Some(Err(result.into_error()));
                }
                _ => {
                    self.done = true;
                    return Some(Err(Error::Programming(
                        "the streamed statement opened a COPY sub-protocol".into(),
                    )));
                }
            }
        }
    }

    /// Collect every remaining row.
    pub async fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Abandon the stream: cancel the query and drain the leftovers.
    pub async fn close(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.cursor.conn.cancel();
        loop {
            let mut machine = Fetch::new();
            match self.cursor.conn.pump(&mut machine).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    self.done = true;
                    return Err(err);
                }
            }
        }
        self.done = true;
        Ok(())
    }
}

impl<C: Transport> Drop for RowStream<'_, '_, C> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("row stream dropped mid-query; closing the connection");
        self.cursor.conn.close();
    }
}

enum CopyDirection {
    In,
    Out,
}

/// An open COPY sub-protocol.
///
/// For COPY FROM STDIN, feed data with [`Copy::write`] or the row helpers
/// and call [`Copy::finish`] to commit. For COPY TO STDOUT, pull data with
/// [`Copy::read`] or [`Copy::read_row`] until exhausted, or call
/// [`Copy::finish`] to skip the rest. Dropping an unfinished copy closes
/// the connection, because the sub-protocol cannot be wound down without
/// awaiting.
pub struct Copy<'a, 'c, C: Transport> {
    cursor: &'a mut Cursor<'c, C>,
    direction: CopyDirection,
    buffer: Vec<u8>,
    pending: Vec<u8>,
    binary: bool,
    finished: bool,
}

impl<C: Transport> Copy<'_, '_, C> {
    fn ensure_writable(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Programming("the COPY operation is finished".into()));
        }
        match self.direction {
            CopyDirection::In => Ok(()),
            CopyDirection::Out => Err(Error::Programming(
                "this COPY reads from the server; use read()".into(),
            )),
        }
    }

    /// The COPY statement's own final result must report success; anything
    /// else means the copy did not go through even without a fatal error.
    fn accept_final(&mut self, result: PqResult) -> Result<()> {
        self.finished = true;
        match result.status {
            ExecStatus::CommandOk => {
                self.cursor.set.adopt(vec![result]);
                Ok(())
            }
            ExecStatus::FatalError => Err(result.into_error()),
            status => Err(Error::Operational(format!(
                "COPY ended with unexpected status {status:?}"
            ))),
        }
    }

    /// Append raw copy data, pushing a chunk out when the buffer fills.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= COPY_BUFFER_SIZE {
            self.flush_chunk().await?;
        }
        Ok(())
    }

    /// Append one row in the COPY text format.
    pub async fn write_row(&mut self, fields: &[&dyn ToParam]) -> Result<()> {
        self.ensure_writable()?;
        if self.binary {
            return Err(Error::Programming(
                "cannot mix text and binary rows in one COPY".into(),
            ));
        }
        let params: Vec<_> = fields.iter().map(|f| f.to_param()).collect();
        let values: Vec<Option<&[u8]>> =
            params.iter().map(|p| p.value.as_deref()).collect();
        let mut line = Vec::new();
        wire::write_copy_text_row(&mut line, &values);
        self.write(&line).await
    }

    /// Append one row in the COPY binary format; the header and trailer
    /// are handled here.
    pub async fn write_binary_row(&mut self, fields: &[&dyn ToParam]) -> Result<()> {
        self.ensure_writable()?;
        if !self.binary {
            if !self.buffer.is_empty() {
                return Err(Error::Programming(
                    "cannot mix text and binary rows in one COPY".into(),
                ));
            }
            wire::write_copy_header(&mut self.buffer);
            self.binary = true;
        }
        let params: Vec<_> = fields.iter().map(|f| f.to_param()).collect();
        let values: Vec<Option<&[u8]>> =
            params.iter().map(|p| p.value.as_deref()).collect();
        wire::write_copy_row(&mut self.buffer, &values);
        if self.buffer.len() >= COPY_BUFFER_SIZE {
            self.flush_chunk().await?;
        }
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = mem::take(&mut self.buffer);
        let mut machine = CopyIn::new(data);
        self.cursor.conn.pump(&mut machine).await
    }

    /// The next chunk of COPY TO STDOUT data, or `None` at end of stream.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        if matches!(self.direction, CopyDirection::In) {
            return Err(Error::Programming(
                "this COPY writes to the server; use write()".into(),
            ));
        }
        let mut machine = CopyOut::new();
        match self.cursor.conn.pump(&mut machine).await? {
            CopyOutput::Data(chunk) => Ok(Some(chunk)),
            CopyOutput::Done(result) => {
                self.accept_final(result)?;
                Ok(None)
            }
        }
    }

    /// The next row of a text-format COPY TO STDOUT, unescaped, with
    /// `None` for SQL NULL fields.
    pub async fn read_row(&mut self) -> Result<Option<Vec<Option<String>>>> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.pending) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(Some(wire::parse_copy_text_row(&line[..line.len() - 1])?));
            }
            match self.read().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => {
                    if !self.pending.is_empty() {
                        return Err(Error::Data(
                            "COPY stream ended in the middle of a row".into(),
                        ));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Terminate the copy and collect the final result.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        match self.direction {
            CopyDirection::In => {
                if self.binary {
                    wire::write_copy_trailer(&mut self.buffer);
                }
                self.flush_chunk().await?;
                let mut machine = CopyEnd::new(None);
                let result = self.cursor.conn.pump(&mut machine).await?;
                self.accept_final(result)?;
            }
            CopyDirection::Out => {
                while self.read().await?.is_some() {}
            }
        }
        Ok(())
    }

    /// Abort a half-written COPY FROM STDIN instead of committing it.
    pub async fn abort(&mut self, reason: &str) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if matches!(self.direction, CopyDirection::Out) {
            return self.finish().await;
        }
        self.finished = true;
        let mut machine = CopyEnd::new(Some(reason.into()));
        self.cursor.conn.pump(&mut machine).await.map(drop)
    }
}

impl<C: Transport> Drop for Copy<'_, '_, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("COPY dropped mid-exchange; closing the connection");
        self.cursor.conn.close();
    }
}

/// A named cursor living on the server, driven with DECLARE and FETCH.
///
/// Call [`ServerCursor::close`] when done; dropping an open cursor only
/// logs a warning and leaves the server-side cursor to die with its
/// transaction or session.
pub struct ServerCursor<'c, C: Transport> {
    conn: &'c mut Connection<C>,
    name: String,
    scrollable: Option<bool>,
    withhold: bool,
    declared: bool,
    closed: bool,
}

impl<'c, C: Transport> ServerCursor<'c, C> {
    pub(crate) fn new(conn: &'c mut Connection<C>, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
            scrollable: None,
            withhold: false,
            declared: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for an explicitly SCROLL or NO SCROLL cursor.
    pub fn scrollable(mut self, scrollable: bool) -> Self {
        self.scrollable = Some(scrollable);
        self
    }

    /// Declare the cursor WITH HOLD, surviving its transaction.
    pub fn with_hold(mut self) -> Self {
        self.withhold = true;
        self
    }

    fn ensure_declared(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Interface("the cursor is closed".into()));
        }
        if !self.declared {
            return Err(Error::Programming(
                "the cursor hasn't been declared yet".into(),
            ));
        }
        Ok(())
    }

    /// DECLARE the cursor over `sql`.
    pub async fn declare(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<()> {
        if self.closed {
            return Err(Error::Interface("the cursor is closed".into()));
        }
        if self.declared {
            return Err(Error::Programming("the cursor is already open".into()));
        }
        let mut stmt = format!("DECLARE {}", quote_ident(&self.name));
        match self.scrollable {
            Some(true) => stmt.push_str(" SCROLL"),
            Some(false) => stmt.push_str(" NO SCROLL"),
            None => {}
        }
        stmt.push_str(" CURSOR");
        if self.withhold {
            stmt.push_str(" WITH HOLD");
        }
        stmt.push_str(" FOR ");
        stmt.push_str(sql);
        self.conn.ensure_transaction().await?;
        self.conn
            .exec_command(&stmt, serialize_params(params))
            .await?;
        self.declared = true;
        Ok(())
    }

    /// FETCH FORWARD `n` rows; all remaining rows with `None`.
    pub async fn fetch(&mut self, n: Option<usize>) -> Result<Vec<Row>> {
        self.ensure_declared()?;
        let stmt = match n {
            Some(n) => format!("FETCH FORWARD {n} FROM {}", quote_ident(&self.name)),
            None => format!("FETCH FORWARD ALL FROM {}", quote_ident(&self.name)),
        };
        let results = self.conn.exec_command(&stmt, vec![]).await?;
        let Some(result) = results.into_iter().next() else {
            return Err(Error::Internal("FETCH returned no result".into()));
        };
        let columns = Arc::clone(&result.columns);
        Ok(rows_from_result(&columns, result.rows))
    }

    /// MOVE the cursor position, relative to the current position or to
    /// the start.
    pub async fn scroll(&mut self, value: i64, absolute: bool) -> Result<()> {
        self.ensure_declared()?;
        let mode = if absolute { "ABSOLUTE" } else { "RELATIVE" };
        let stmt = format!("MOVE {mode} {value} IN {}", quote_ident(&self.name));
        self.conn.exec_command(&stmt, vec![]).await?;
        Ok(())
    }

    /// CLOSE the server cursor, if it still exists.
    ///
    /// A failed transaction may have destroyed the cursor already, so its
    /// existence is checked in pg_cursors first.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed || !self.declared || self.conn.is_closed() {
            self.closed = true;
            return Ok(());
        }
        if self.conn.transaction_status() == crate::transport::TransactionStatus::InError {
            // The cursor dies with the failed transaction.
            self.closed = true;
            return Ok(());
        }
        let check = format!(
            "SELECT name FROM pg_cursors WHERE name = {}",
            quote_literal(&self.name)
        );
        let exists = self
            .conn
            .exec_command(&check, vec![])
            .await?
            .first()
            .is_some_and(|res| !res.rows.is_empty());
        if exists {
            self.conn
                .exec_command(&format!("CLOSE {}", quote_ident(&self.name)), vec![])
                .await?;
        }
        self.closed = true;
        Ok(())
    }
}

impl<C: Transport> Drop for ServerCursor<'_, C> {
    fn drop(&mut self) {
        if !self.closed && self.declared {
            warn!(cursor = %self.name, "server cursor dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::lab::{LabStep, LabTransport, SentCommand};
    use crate::transport::SharedColumns;

    fn text_columns(names: &[&str]) -> SharedColumns {
        Arc::new(
            names
                .iter()
                .map(|name| ColumnDescription {
                    name: (*name).into(),
                    type_oid: crate::adapt::oids::TEXT,
                    type_modifier: -1,
                    type_size: -1,
                    format: Format::Text,
                })
                .collect(),
        )
    }

    fn tuples(columns: &SharedColumns, rows: Vec<Vec<Option<Vec<u8>>>>) -> PqResult {
        let mut result = PqResult::with_status(ExecStatus::TuplesOk);
        result.columns = Arc::clone(columns);
        result.rows = rows;
        result
    }

    fn command_ok(tag: &str) -> PqResult {
        let mut result = PqResult::with_status(ExecStatus::CommandOk);
        result.command_tag = Some(tag.into());
        result
    }

    #[tokio::test]
    async fn execute_fetches_rows() {
        let (transport, control) = LabTransport::pair();
        let columns = text_columns(&["id", "name"]);
        control.script_results([tuples(
            &columns,
            vec![
                vec![Some(b"1".to_vec()), Some(b"ada".to_vec())],
                vec![Some(b"2".to_vec()), Some(b"bob".to_vec())],
            ],
        )]);
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        let mut cursor = conn.cursor();
        cursor
            .execute("SELECT id, name FROM users", &[])
            .await
            .unwrap();
        assert_eq!(cursor.rowcount().await.unwrap(), 2);
        let row = cursor.fetch_one().await.unwrap().unwrap();
        assert_eq!(row.get_by_name::<i32>("id").unwrap(), 1);
        let rest = cursor.fetch_all().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(cursor.fetch_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn executemany_queues_a_batch_under_pipeline() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        conn.pipeline(async |conn| {
            control.push(LabStep::Result(command_ok("INSERT 0 1")));
            control.push(LabStep::Done);
            control.push(LabStep::Result(command_ok("INSERT 0 1")));
            control.push(LabStep::Done);
            let mut cursor = conn.cursor();
            let one: &[&dyn ToParam] = &[&1_i32];
            let two: &[&dyn ToParam] = &[&2_i32];
            let affected = cursor
                .executemany("INSERT INTO t VALUES ($1)", &[one, two], false)
                .await?;
            assert_eq!(affected, 2);
            control.push(LabStep::Result(PqResult::with_status(
                ExecStatus::PipelineSync,
            )));
            Ok(())
        })
        .await
        .unwrap();
        let sent = control.sent();
        assert!(matches!(sent[0], SentCommand::QueryParams { .. }));
        assert!(matches!(sent[1], SentCommand::QueryParams { .. }));
        assert_eq!(sent[2], SentCommand::FlushRequest);
    }

    #[tokio::test]
    async fn stream_forces_the_extended_protocol() {
        let (transport, control) = LabTransport::pair();
        let columns = text_columns(&["x"]);
        let mut chunk = tuples(&columns, vec![
            vec![Some(b"1".to_vec())],
            vec![Some(b"2".to_vec())],
        ]);
        chunk.status = ExecStatus::TuplesChunk;
        control.script_results([chunk, tuples(&columns, vec![])]);
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        let mut cursor = conn.cursor();
        let mut stream = cursor.stream("SELECT x FROM big", &[]).await.unwrap();
        let mut values = Vec::new();
        while let Some(row) = stream.next().await {
            values.push(row.unwrap().get::<i32>(0).unwrap());
        }
        assert_eq!(values, vec![1, 2]);
        let sent = control.sent();
        assert!(matches!(sent[0], SentCommand::QueryParams { .. }));
        assert!(sent.contains(&SentCommand::ChunkedRowsMode(STREAM_CHUNK_ROWS)));
        assert!(!sent.iter().any(|cmd| matches!(cmd, SentCommand::Query(_))));
    }

    #[tokio::test]
    async fn dropped_stream_closes_the_connection() {
        let (transport, control) = LabTransport::pair();
        let columns = text_columns(&["x"]);
        let mut single = tuples(&columns, vec![vec![Some(b"1".to_vec())]]);
        single.status = ExecStatus::SingleTuple;
        control.script_results([single, tuples(&columns, vec![])]);
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        {
            let mut cursor = conn.cursor();
            let mut stream = cursor.stream("SELECT x FROM big", &[]).await.unwrap();
            let _first = stream.next().await;
        }
        assert!(conn.is_closed());
        assert!(control.finished());
    }

    #[tokio::test]
    async fn copy_in_writes_rows_and_finishes() {
        let (transport, control) = LabTransport::pair();
        control.push(LabStep::Result(PqResult::with_status(ExecStatus::CopyIn)));
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        let mut cursor = conn.cursor();
        let mut copy = cursor.copy("COPY t FROM STDIN", &[]).await.unwrap();
        copy.write_row(&[&1_i32, &"a\tb"]).await.unwrap();
        copy.write_row(&[&2_i32, &Option::<String>::None])
            .await
            .unwrap();
        control.script_results([command_ok("COPY 2")]);
        copy.finish().await.unwrap();
        drop(copy);
        let sent = control.sent();
        let data = sent
            .iter()
            .find_map(|cmd| match cmd {
                SentCommand::CopyData(data) => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(data, b"1\ta\\tb\n2\t\\N\n".to_vec());
        assert!(sent.contains(&SentCommand::CopyEnd(None)));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn copy_out_reads_rows_until_done() {
        let (transport, control) = LabTransport::pair();
        control.push(LabStep::Result(PqResult::with_status(ExecStatus::CopyOut)));
        control.script_copy_out([
            crate::transport::CopyOutChunk::Data(b"1\tone\n".to_vec()),
            crate::transport::CopyOutChunk::Done,
        ]);
        control.script_results([command_ok("COPY 1")]);
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        let mut cursor = conn.cursor();
        let mut copy = cursor.copy("COPY t TO STDOUT", &[]).await.unwrap();
        let row = copy.read_row().await.unwrap().unwrap();
        assert_eq!(row, vec![Some("1".into()), Some("one".into())]);
        assert!(copy.read_row().await.unwrap().is_none());
        copy.finish().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_copy_closes_the_connection() {
        let (transport, control) = LabTransport::pair();
        control.push(LabStep::Result(PqResult::with_status(ExecStatus::CopyIn)));
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        {
            let mut cursor = conn.cursor();
            let mut copy = cursor.copy("COPY t FROM STDIN", &[]).await.unwrap();
            copy.write(b"1\tone\n").await.unwrap();
        }
        assert!(conn.is_closed());
        assert!(control.finished());
    }

    #[tokio::test]
    async fn server_cursor_declares_fetches_and_closes() {
        let (transport, control) = LabTransport::pair();
        let columns = text_columns(&["x"]);
        let mut conn = Connection::wrap(transport);
        conn.set_autocommit(true).unwrap();
        control.script_results([command_ok("DECLARE CURSOR")]);
        let mut cursor = conn.server_cursor("c1");
        cursor.declare("SELECT x FROM big", &[]).await.unwrap();
        control.script_results([tuples(&columns, vec![vec![Some(b"1".to_vec())]])]);
        let rows = cursor.fetch(Some(10)).await.unwrap();
        assert_eq!(rows.len(), 1);
        control.script_results([tuples(&columns, vec![vec![Some(b"c1".to_vec())]])]);
        control.script_results([command_ok("CLOSE CURSOR")]);
        cursor.close().await.unwrap();
        let sent = control.sent();
        assert_eq!(
            sent[1],
            SentCommand::Query("FETCH FORWARD 10 FROM \"c1\"".into())
        );
        assert_eq!(sent[3], SentCommand::Query("CLOSE \"c1\"".into()));
    }
}

//! Client-side and server-side cursors.
//!
//! A [`Cursor`] runs statements on a borrowed [`Connection`] and walks the
//! result sets; [`RowStream`] and [`Copy`] are the streaming faces of the
//! same exchange. A [`ServerCursor`] wraps a DECLAREd cursor living on the
//! server.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use memchr::memchr;
use tracing::warn;

use crate::adapt::{rows_from_result, serialize_params, Row, ToParam};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::machine::{
    CopyEnd, CopyIn, CopyOut, CopyOutput, Execute, Fetch, QueuedCommand, Send,
};
use crate::prepare::{Decision, StatementKey};
use crate::session::{
    quote_ident, quote_literal, ResultSet, COPY_BUFFER_SIZE, STREAM_CHUNK_ROWS,
};
use crate::transport::{
    ColumnDescription, ExecStatus, Format, Oid, PqResult, Transport,
};
use crate::wire;

pub use crate::session::ExecuteOptions;

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
    pub fn execute(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<&mut Self> {
        self.execute_with(sql, params, &ExecuteOptions::default())
    }

    /// Run a statement.
    ///
    /// With an active pipeline the statement is queued and its results are
    /// redeemed lazily on first access; otherwise results are fetched
    /// before returning.
    pub fn execute_with(
        &mut self,
        sql: &str,
        params: &[&dyn ToParam],
        options: &ExecuteOptions,
    ) -> Result<&mut Self> {
        self.ensure_open()?;
        self.reset();
        let params = serialize_params(params);
        self.conn.run_maintenance()?;
        self.conn.ensure_transaction()?;
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
                let results = self.conn.pump(&mut machine)?;
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
        let results = self.conn.pump(&mut machine)?;
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
    pub fn executemany(
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
                self.execute(sql, params)?;
                if let Some(ticket) = self.pending_ticket.take() {
                    tickets.push(ticket);
                }
            }
            for group in self.conn.pipeline_fetch_batch(&tickets)? {
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
                self.execute(sql, params)?;
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
    fn ensure_results(&mut self) -> Result<()> {
        if let Some(ticket) = self.pending_ticket.take() {
            let results = self.conn.pipeline_fetch(ticket)?;
            let results = ResultSet::screen(&mut self.conn.session, results)?;
            self.set.adopt(results);
        }
        Ok(())
    }

    /// The next row of the current result set, or `None` when exhausted.
    pub fn fetch_one(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.ensure_results()?;
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
    pub fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            match self.fetch_one()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// All remaining rows of the current result set.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.ensure_results()?;
        let index = self.set.row;
        let result = self.set.verified_mut()?;
        let tail = result.rows.split_off(index.min(result.rows.len()));
        let columns = Arc::clone(&result.columns);
        self.set.row = result.rows.len();
        Ok(rows_from_result(&columns, tail))
    }

    /// Iterate over the remaining rows of the current result set.
    pub fn rows(&mut self) -> Result<std::vec::IntoIter<Row>> {
        Ok(self.fetch_all()?.into_iter())
    }

    /// Advance to the next result set of a multi-statement execution.
    pub fn nextset(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_results()?;
        Ok(self.set.nextset())
    }

    /// Column descriptors of the current result set, if it has any.
    pub fn description(&mut self) -> Result<Option<&[ColumnDescription]>> {
        self.ensure_open()?;
        self.ensure_results()?;
        Ok(self
            .set
            .current()
            .filter(|res| !res.columns.is_empty())
            .map(|res| res.columns.as_slice()))
    }

    /// Rows returned by a query, or affected by a command; `-1` when the
    /// command does not report a count.
    pub fn rowcount(&mut self) -> Result<i64> {
        self.ensure_open()?;
        self.ensure_results()?;
        Ok(self.set.rowcount())
    }

    /// Run a query and stream its rows without buffering the whole set.
    ///
    /// Always goes through the extended sub-protocol, so the row mode
    /// request cannot race a multi-statement string. Uses chunked-rows
    /// mode when the transport supports it, single-row mode otherwise.
    pub fn stream(
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
        self.conn.run_maintenance()?;
        self.conn.ensure_transaction()?;
        {
            let transport = self.conn.transport_mut()?;
            transport.send_query_params(sql, &params, Format::Text)?;
            if transport.supports_chunked_rows() {
                transport.set_chunked_rows_mode(STREAM_CHUNK_ROWS)?;
            } else {
                transport.set_single_row_mode()?;
            }
        }
        let mut send = Send::new();
        self.conn.pump(&mut send)?;
        Ok(RowStream {
            cursor: self,
            buffer: VecDeque::new(),
            done: false,
        })
    }

    /// Open a COPY sub-protocol for `sql`, which must be a single COPY
    /// statement.
    pub fn copy(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<Copy<'_, 'c, C>> {
        self.ensure_open()?;
        if self.conn.pipeline_active() {
            return Err(Error::NotSupported(
                "COPY cannot be used in pipeline mode".into(),
            ));
        }
        self.reset();
        let params = serialize_params(params);
        self.conn.run_maintenance()?;
        self.conn.ensure_transaction()?;
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
        let mut results = self.conn.pump(&mut machine)?;
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
/// Dropping the stream before exhaustion cancels the query and drains the
/// leftovers; failures on that path are logged, not raised.
pub struct RowStream<'a, 'c, C: Transport> {
    cursor: &'a mut Cursor<'c, C>,
    buffer: VecDeque<Row>,
    done: bool,
}

impl<C: Transport> Iterator for RowStream<'_, '_, C> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            let mut machine = Fetch::new();
            let fetched = match self.cursor.conn.pump(&mut machine) {
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
}

impl<C: Transport> Drop for RowStream<'_, '_, C> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.cursor.conn.cancel();
        loop {
            let mut machine = Fetch::new();
            match self.cursor.conn.pump(&mut machine) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "draining interrupted row stream failed");
                    break;
                }
            }
        }
    }
}

enum CopyDirection {
    In,
    Out,
}

/// An open COPY sub-protocol.
///
/// For COPY FROM STDIN, feed data with [`Copy::write`] or the row helpers
/// and call [`Copy::finish`] to commit; dropping an unfinished writer
/// aborts the copy server-side. For COPY TO STDOUT, pull data with
/// [`Copy::read`] or [`Copy::read_row`].
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
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= COPY_BUFFER_SIZE {
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Append one row in the COPY text format.
    pub fn write_row(&mut self, fields: &[&dyn ToParam]) -> Result<()> {
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
        self.write(&line)
    }

    /// Append one row in the COPY binary format; the header and trailer
    /// are handled here.
    pub fn write_binary_row(&mut self, fields: &[&dyn ToParam]) -> Result<()> {
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
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = mem::take(&mut self.buffer);
        let mut machine = CopyIn::new(data);
        self.cursor.conn.pump(&mut machine)
    }

    /// The next chunk of COPY TO STDOUT data, or `None` at end of stream.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        if matches!(self.direction, CopyDirection::In) {
            return Err(Error::Programming(
                "this COPY writes to the server; use write()".into(),
            ));
        }
        let mut machine = CopyOut::new();
        match self.cursor.conn.pump(&mut machine)? {
            CopyOutput::Data(chunk) => Ok(Some(chunk)),
            CopyOutput::Done(result) => {
                self.accept_final(result)?;
                Ok(None)
            }
        }
    }

    /// The next row of a text-format COPY TO STDOUT, unescaped, with
    /// `None` for SQL NULL fields.
    pub fn read_row(&mut self) -> Result<Option<Vec<Option<String>>>> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.pending) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(Some(wire::parse_copy_text_row(&line[..line.len() - 1])?));
            }
            match self.read()? {
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
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        match self.direction {
            CopyDirection::In => {
                if self.binary {
                    wire::write_copy_trailer(&mut self.buffer);
                }
                self.flush_chunk()?;
                let mut machine = CopyEnd::new(None);
                let result = self.cursor.conn.pump(&mut machine)?;
                self.accept_final(result)?;
            }
            CopyDirection::Out => {
                while self.read()?.is_some() {}
            }
        }
        Ok(())
    }
}

impl<C: Transport> Drop for Copy<'_, '_, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.direction {
            CopyDirection::In => {
                // Abort instead of committing a half-written copy.
                let mut machine = CopyEnd::new(Some("COPY writer dropped".into()));
                if let Err(err) = self.cursor.conn.pump(&mut machine) {
                    warn!(error = %err, "aborting interrupted COPY failed");
                }
            }
            CopyDirection::Out => {
                self.cursor.conn.cancel();
                while let Ok(Some(_)) = self.read() {}
            }
        }
    }
}

/// A named cursor living on the server, driven with DECLARE and FETCH.
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
    pub fn declare(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<()> {
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
        self.conn.ensure_transaction()?;
        self.conn.exec_command(&stmt, serialize_params(params))?;
        self.declared = true;
        Ok(())
    }

    /// FETCH FORWARD `n` rows; all remaining rows with `None`.
    pub fn fetch(&mut self, n: Option<usize>) -> Result<Vec<Row>> {
        self.ensure_declared()?;
        let stmt = match n {
            Some(n) => format!("FETCH FORWARD {n} FROM {}", quote_ident(&self.name)),
            None => format!("FETCH FORWARD ALL FROM {}", quote_ident(&self.name)),
        };
        let results = self.conn.exec_command(&stmt, vec![])?;
        let Some(result) = results.into_iter().next() else {
            return Err(Error::Internal("FETCH returned no result".into()));
        };
        let columns = Arc::clone(&result.columns);
        Ok(rows_from_result(&columns, result.rows))
    }

    /// MOVE the cursor position, relative to the current position or to
    /// the start.
    pub fn scroll(&mut self, value: i64, absolute: bool) -> Result<()> {
        self.ensure_declared()?;
        let mode = if absolute { "ABSOLUTE" } else { "RELATIVE" };
        let stmt = format!("MOVE {mode} {value} IN {}", quote_ident(&self.name));
        self.conn.exec_command(&stmt, vec![])?;
        Ok(())
    }

    /// CLOSE the server cursor, if it still exists.
    ///
    /// A failed transaction may have destroyed the cursor already, so its
    /// existence is checked in pg_cursors first.
    pub fn close(&mut self) -> Result<()> {
        if self.closed || !self.declared || self.conn.is_closed() {
            self.closed = true;
            return Ok(());
        }
        if self.conn.transaction_status() == crate::transport::TransactionStatus::InError {
            // The cursor dies with the failed transaction.
            self.closed = true;
            return Ok(());
        }
        let probe = format!(
            "SELECT name FROM pg_cursors WHERE name = {}",
            quote_literal(&self.name)
        );
        let exists = self
            .conn
            .exec_command(&probe, vec![])?
            .first()
            .is_some_and(|res| !res.rows.is_empty());
        if exists {
            self.conn
                .exec_command(&format!("CLOSE {}", quote_ident(&self.name)), vec![])?;
        }
        self.closed = true;
        Ok(())
    }
}

impl<C: Transport> Drop for ServerCursor<'_, C> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, cursor = %self.name, "closing server cursor failed");
        }
    }
}

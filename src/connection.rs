//! Blocking connection façade: session settings, transactions, pipeline
//! scope, cancellation, notifications and two-phase commit.
//!
//! A [`Connection`] owns its transport exclusively; `&mut self` on every
//! operation gives the serialization a per-connection lock would, without
//! one. All I/O goes through pumped machines, so nothing here ever blocks
//! on the socket directly. The tokio flavor in [`crate::tokio`] drives the
//! same [`SessionCore`] with the cooperative waiter.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::adapt::Param;
use crate::conninfo::Conninfo;
use crate::error::{Error, Result};
use crate::machine::{
    self, Cancel, Connect, Execute, FetchGroups, Machine, Notifies, PipelineCommunicate,
    QueuedCommand,
};
use crate::pipeline::PipelineState;
use crate::prepare::{Decision, Maintenance, StatementKey};
use crate::session::{closed, SessionCore, TpcState, CLOSE_PREPARED_VERSION};
use crate::transport::{
    CancelRequest as _, ExecStatus, Format, Notify, PqResult, TransactionStatus, Transport,
};
use crate::waiting;

pub use crate::session::IsolationLevel;
pub(crate) use crate::session::{quote_ident, quote_literal};

/// A PostgreSQL session over a non-blocking transport.
pub struct Connection<C: Transport> {
    transport: Option<C>,
    pub(crate) session: SessionCore,
}

impl<C: Transport> Connection<C> {
    /// Adopt an already-established transport.
    pub fn wrap(transport: C) -> Self {
        Self {
            transport: Some(transport),
            session: SessionCore::new(),
        }
    }

    /// Connect using a DSN in keyword or URI form.
    pub fn connect(dsn: &str) -> Result<Self> {
        Self::connect_conninfo(&Conninfo::parse(dsn)?)
    }

    /// Connect using an already-parsed parameter map.
    ///
    /// Hosts are attempted in the order [`Conninfo::attempts`] produces;
    /// the first successful handshake wins and the last failure is raised
    /// when none succeeds.
    pub fn connect_conninfo(info: &Conninfo) -> Result<Self> {
        let attempts = info.attempts(|key| std::env::var(key).ok())?;
        let timeout = info.timeout();
        let mut last_error = None;
        for params in attempts {
            let deadline = timeout.map(|t| Instant::now() + t);
            let mut transport = match C::connect_start(&params) {
                Ok(transport) => transport,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            let mut machine = Connect::new(deadline);
            match waiting::wait(&mut machine, &mut transport) {
                Ok(()) => {
                    debug!(
                        server_version = transport.server_version(),
                        backend_pid = transport.backend_pid(),
                        "connected"
                    );
                    return Ok(Self::wrap(transport));
                }
                Err(err) => {
                    debug!(error = %err, "connection attempt failed");
                    transport.finish();
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Operational("no usable connection attempt".into())))
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Release the transport. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.finish();
        }
        self.session.pipeline = None;
        self.session.pipeline_depth = 0;
    }

    pub(crate) fn transport_mut(&mut self) -> Result<&mut C> {
        self.transport.as_mut().ok_or_else(closed)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        match &self.transport {
            Some(transport) => transport.transaction_status(),
            None => TransactionStatus::Unknown,
        }
    }

    pub fn server_version(&self) -> Option<u32> {
        self.transport.as_ref().map(|t| t.server_version())
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.transport.as_ref().map(|t| t.backend_pid())
    }

    pub fn autocommit(&self) -> bool {
        self.session.autocommit
    }

    pub fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        self.ensure_settable("autocommit")?;
        self.session.autocommit = autocommit;
        Ok(())
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.session.isolation_level
    }

    pub fn set_isolation_level(&mut self, level: Option<IsolationLevel>) -> Result<()> {
        self.ensure_settable("isolation_level")?;
        self.session.isolation_level = level;
        self.session.invalidate_begin();
        Ok(())
    }

    pub fn set_read_only(&mut self, read_only: Option<bool>) -> Result<()> {
        self.ensure_settable("read_only")?;
        self.session.read_only = read_only;
        self.session.invalidate_begin();
        Ok(())
    }

    pub fn set_deferrable(&mut self, deferrable: Option<bool>) -> Result<()> {
        self.ensure_settable("deferrable")?;
        self.session.deferrable = deferrable;
        self.session.invalidate_begin();
        Ok(())
    }

    /// Executions after which a statement is prepared server-side;
    /// `None` disables automatic preparation.
    pub fn set_prepare_threshold(&mut self, threshold: Option<usize>) {
        self.session.prepare.set_threshold(threshold);
    }

    fn ensure_settable(&self, what: &str) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        self.session.ensure_settable(what, self.transaction_status())
    }

    /// Pump one machine over the transport, then sweep in notifications.
    pub(crate) fn pump<M: Machine<C>>(&mut self, machine: &mut M) -> Result<M::Output> {
        let transport = self.transport.as_mut().ok_or_else(closed)?;
        let output = waiting::wait(machine, transport);
        self.sweep_notifies();
        output
    }

    fn sweep_notifies(&mut self) {
        let mut incoming = Vec::new();
        if let Some(transport) = self.transport.as_mut() {
            while let Some(notify) = transport.take_notify() {
                incoming.push(notify);
            }
        }
        for notify in incoming {
            self.session.dispatch_notify(notify);
        }
    }

    /// Run a statement of our own, queuing it when a pipeline is active.
    ///
    /// Parameterless statements go through the simple sub-protocol, which
    /// connection poolers understand better than an empty Bind.
    pub(crate) fn exec_command(&mut self, sql: &str, params: Vec<Param>) -> Result<Vec<PqResult>> {
        if let Some(state) = self.session.pipeline.as_mut() {
            state.enqueue(
                QueuedCommand::QueryParams {
                    sql: sql.into(),
                    params,
                    result_format: Format::Text,
                },
                None,
                false,
            );
            return Ok(Vec::new());
        }
        trace!(sql, "executing internal command");
        {
            let transport = self.transport_mut()?;
            if params.is_empty() {
                transport.send_query(sql)?;
            } else {
                transport.send_query_params(sql, &params, Format::Text)?;
            }
        }
        let mut machine = Execute::new();
        let results = self.pump(&mut machine)?;
        if let Some(failed) = results
            .iter()
            .find(|res| res.status == ExecStatus::FatalError)
        {
            return Err(failed.clone().into_error());
        }
        self.session.note_destructive_tags(&results);
        Ok(results)
    }

    /// Run deferred prepared-statement cleanup.
    pub(crate) fn run_maintenance(&mut self) -> Result<()> {
        for task in self.session.prepare.take_maintenance() {
            match task {
                Maintenance::Deallocate(name) => {
                    if self.session.pipeline.is_some() {
                        if let Some(state) = self.session.pipeline.as_mut() {
                            state.enqueue(QueuedCommand::ClosePrepared { name }, None, false);
                        }
                    } else if self.server_version().unwrap_or(0) >= CLOSE_PREPARED_VERSION {
                        self.transport_mut()?.send_close_prepared(&name)?;
                        let mut machine = Execute::new();
                        self.pump(&mut machine)?;
                    } else {
                        self.exec_command(&format!("DEALLOCATE {}", quote_ident(&name)), vec![])?;
                    }
                }
                Maintenance::DeallocateAll => {
                    self.exec_command("DEALLOCATE ALL", vec![])?;
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn begin_statement(&mut self) -> String {
        self.session.begin_statement()
    }

    /// Open a transaction block if the session needs one for the next
    /// statement.
    pub(crate) fn ensure_transaction(&mut self) -> Result<()> {
        if self.session.autocommit || self.session.begin_pending {
            return Ok(());
        }
        if self.transaction_status() != TransactionStatus::Idle {
            return Ok(());
        }
        let begin = self.session.begin_statement();
        self.exec_command(&begin, vec![])?;
        if self.session.pipeline.is_some() {
            // The queued BEGIN has not run yet; don't queue another.
            self.session.begin_pending = true;
        }
        Ok(())
    }

    /// Commit the current transaction. A no-op when idle.
    pub fn commit(&mut self) -> Result<()> {
        self.session.ensure_finishable("commit")?;
        if self.session.pipeline.is_none()
            && self.transaction_status() == TransactionStatus::Idle
        {
            return Ok(());
        }
        self.exec_command("COMMIT", vec![])?;
        self.session.begin_pending = false;
        Ok(())
    }

    /// Roll back the current transaction. A no-op when idle.
    ///
    /// Server-side prepared statements do not survive a rollback of the
    /// transaction that prepared them, so the statement cache is cleared.
    pub fn rollback(&mut self) -> Result<()> {
        self.session.ensure_finishable("rollback")?;
        if self.session.pipeline.is_none()
            && self.transaction_status() == TransactionStatus::Idle
        {
            return Ok(());
        }
        self.exec_command("ROLLBACK", vec![])?;
        self.session.begin_pending = false;
        self.session.prepare.clear();
        Ok(())
    }

    /// Run `f` inside a transaction block.
    ///
    /// The outermost call brackets `f` with BEGIN and COMMIT; nested calls
    /// use savepoints. An error from `f` rolls back to the start of the
    /// block and is returned unchanged.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let savepoint = if self.session.tx_depth == 0
            && self.transaction_status() == TransactionStatus::Idle
        {
            let begin = self.session.begin_statement();
            self.exec_command(&begin, vec![])?;
            None
        } else {
            let name = format!("_pg_savepoint_{}", self.session.tx_depth);
            self.exec_command(&format!("SAVEPOINT {}", quote_ident(&name)), vec![])?;
            Some(name)
        };
        self.session.tx_depth += 1;
        let result = f(self);
        self.session.tx_depth -= 1;
        match result {
            Ok(value) => {
                match &savepoint {
                    None => self.exec_command("COMMIT", vec![])?,
                    Some(name) => self
                        .exec_command(&format!("RELEASE SAVEPOINT {}", quote_ident(name)), vec![])?,
                };
                Ok(value)
            }
            Err(err) => {
                let rollback = match &savepoint {
                    None => "ROLLBACK".to_string(),
                    Some(name) => format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)),
                };
                if let Err(rb_err) = self.exec_command(&rollback, vec![]) {
                    warn!(error = %rb_err, "rollback after failed transaction block failed");
                }
                if savepoint.is_none() {
                    self.session.prepare.clear();
                }
                Err(err)
            }
        }
    }

    /// Best-effort cancellation of the command in flight. A no-op on a
    /// closed connection; delivery failures are logged, not raised.
    pub fn cancel(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        match transport.cancel_conn() {
            Ok(mut request) => {
                if let Err(err) = request.cancel_blocking() {
                    warn!(error = %err, "cancel request failed");
                }
            }
            Err(err) => warn!(error = %err, "could not create cancel request"),
        }
    }

    /// Non-blocking cancellation with an optional deadline.
    ///
    /// Falls back to the blocking form when the transport does not support
    /// the non-blocking handshake.
    pub fn cancel_safe(&mut self, timeout: Option<Duration>) -> Result<()> {
        let Some(transport) = self.transport.as_ref() else {
            return Ok(());
        };
        let mut request = transport.cancel_conn()?;
        if !transport.supports_cancel_safe() {
            return request.cancel_blocking();
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut machine = Cancel::new(deadline);
        waiting::wait(&mut machine, &mut request)
    }

    /// Wait for notifications, draining any backlog first.
    ///
    /// Returns an empty batch when the timeout expires.
    pub fn notifies(&mut self, timeout: Option<Duration>) -> Result<Vec<Notify>> {
        if !self.session.notify_backlog.is_empty() {
            return Ok(self.session.notify_backlog.drain(..).collect());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut machine = Notifies::new(deadline);
        let transport = self.transport.as_mut().ok_or_else(closed)?;
        let batch = waiting::wait(&mut machine, transport)?;
        for notify in &batch {
            for handler in &mut self.session.notify_handlers {
                handler(notify);
            }
        }
        Ok(batch)
    }

    /// Register a callback invoked for every notification as it arrives.
    pub fn add_notify_handler(&mut self, handler: impl FnMut(&Notify) + 'static) {
        self.session.notify_handlers.push(Box::new(handler));
    }

    /// A cursor operating on this connection.
    pub fn cursor(&mut self) -> crate::cursor::Cursor<'_, C> {
        crate::cursor::Cursor::new(self)
    }

    /// A named server-side cursor on this connection.
    pub fn server_cursor(&mut self, name: impl Into<String>) -> crate::cursor::ServerCursor<'_, C> {
        crate::cursor::ServerCursor::new(self, name)
    }

    // Two-phase commit.

    /// Begin a distributed transaction under `xid`.
    pub fn tpc_begin(&mut self, xid: crate::tpc::Xid) -> Result<()> {
        if self.session.tpc.is_some() {
            return Err(Error::Programming(
                "a two-phase transaction is already in progress".into(),
            ));
        }
        if self.transaction_status() != TransactionStatus::Idle {
            return Err(Error::Programming(
                "tpc_begin() must be called outside a transaction".into(),
            ));
        }
        let begin = self.session.begin_statement();
        self.exec_command(&begin, vec![])?;
        self.session.tpc = Some(TpcState {
            xid,
            prepared: false,
        });
        Ok(())
    }

    /// First phase: persist the transaction under its xid.
    pub fn tpc_prepare(&mut self) -> Result<()> {
        let Some(tpc) = self.session.tpc.as_ref() else {
            return Err(Error::Programming(
                "tpc_prepare() requires tpc_begin() first".into(),
            ));
        };
        let sql = format!("PREPARE TRANSACTION {}", quote_literal(&tpc.xid.to_string()));
        self.exec_command(&sql, vec![])?;
        if let Some(tpc) = self.session.tpc.as_mut() {
            tpc.prepared = true;
        }
        Ok(())
    }

    /// Second phase: commit, either our own transaction or a recovered xid.
    pub fn tpc_commit(&mut self, xid: Option<&crate::tpc::Xid>) -> Result<()> {
        self.tpc_finish(xid, "COMMIT PREPARED", "COMMIT")
    }

    /// Second phase: roll back, either our own transaction or a recovered
    /// xid.
    pub fn tpc_rollback(&mut self, xid: Option<&crate::tpc::Xid>) -> Result<()> {
        self.tpc_finish(xid, "ROLLBACK PREPARED", "ROLLBACK")
    }

    fn tpc_finish(&mut self, xid: Option<&crate::tpc::Xid>, prepared_verb: &str, verb: &str) -> Result<()> {
        match xid {
            Some(xid) => {
                if self.transaction_status() != TransactionStatus::Idle {
                    return Err(Error::Programming(format!(
                        "{verb} of a recovered transaction requires an idle connection"
                    )));
                }
                let sql = format!("{prepared_verb} {}", quote_literal(&xid.to_string()));
                self.exec_command(&sql, vec![])?;
            }
            None => {
                let Some(tpc) = self.session.tpc.take() else {
                    return Err(Error::Programming(
                        "no two-phase transaction in progress and no xid given".into(),
                    ));
                };
                if tpc.prepared {
                    let sql =
                        format!("{prepared_verb} {}", quote_literal(&tpc.xid.to_string()));
                    self.exec_command(&sql, vec![])?;
                } else {
                    // One-phase optimization: never prepared, plain finish.
                    self.exec_command(verb, vec![])?;
                }
            }
        }
        self.session.tpc = None;
        Ok(())
    }

    /// List transactions prepared on the server and pending a second phase.
    ///
    /// When the catalog query itself opened a transaction block on a
    /// previously idle connection, the block is rolled back so the
    /// connection comes back idle; a transaction the caller already had
    /// open is left alone.
    pub fn tpc_recover(&mut self) -> Result<Vec<crate::tpc::PreparedTransaction>> {
        let was_idle = self.transaction_status() == TransactionStatus::Idle;
        let results = self.exec_command(
            "SELECT gid, prepared::text, owner, database FROM pg_prepared_xacts",
            vec![],
        )?;
        let mut recovered = Vec::new();
        if let Some(result) = results.first() {
            let columns = std::sync::Arc::clone(&result.columns);
            for values in result.rows.clone() {
                let row = crate::adapt::Row::new(std::sync::Arc::clone(&columns), values);
                recovered.push(crate::tpc::PreparedTransaction {
                    xid: crate::tpc::Xid::parse(&row.get_by_name::<String>("gid")?),
                    prepared: row.get_by_name("prepared")?,
                    owner: row.get_by_name("owner")?,
                    database: row.get_by_name("database")?,
                });
            }
        }
        if was_idle && self.transaction_status() == TransactionStatus::InTransaction {
            // Best-effort cleanup of the block our own query opened; never
            // mask the recovered list.
            if let Err(err) = self.exec_command("ROLLBACK", vec![]) {
                warn!(error = %err, "rollback after recovery query failed");
            }
        }
        Ok(recovered)
    }

    // Pipeline scope.

    /// Run `f` with this connection in pipeline mode.
    ///
    /// Statements executed inside `f` are queued and answered out of
    /// result groups harvested in submission order. The outermost exit
    /// appends a synchronization point, drains every outstanding group and
    /// leaves pipeline mode; nested calls only delimit their commands with
    /// a synchronization point.
    pub fn pipeline<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.session.pipeline_depth == 0 {
            self.transport_mut()?.enter_pipeline_mode()?;
            self.session.pipeline = Some(PipelineState::new());
        }
        self.session.pipeline_depth += 1;
        let result = f(self);
        self.session.pipeline_depth -= 1;
        if self.session.pipeline_depth > 0 {
            if result.is_ok()
                && let Some(state) = self.session.pipeline.as_mut()
            {
                state.enqueue_sync();
            }
            return result;
        }
        match self.leave_pipeline() {
            Ok(()) => result,
            Err(exit_err) => match result {
                Ok(_) => Err(exit_err),
                Err(err) => {
                    // Don't mask the error that broke the pipeline.
                    warn!(error = %exit_err, "pipeline teardown failed");
                    Err(err)
                }
            },
        }
    }

    pub(crate) fn pipeline_active(&self) -> bool {
        self.session.pipeline.is_some()
    }

    /// Queue one command in the active pipeline.
    pub(crate) fn pipeline_enqueue(
        &mut self,
        command: QueuedCommand,
        prepare: Option<(StatementKey, String)>,
        wants_results: bool,
    ) -> Result<Option<usize>> {
        let Some(state) = self.session.pipeline.as_mut() else {
            return Err(Error::Internal("no pipeline is active".into()));
        };
        Ok(state.enqueue(command, prepare, wants_results))
    }

    /// Push queued commands to the server, absorbing early result groups.
    fn pipeline_communicate(&mut self) -> Result<()> {
        let Some(state) = self.session.pipeline.as_mut() else {
            return Ok(());
        };
        if !state.has_commands() {
            return Ok(());
        }
        let commands = state.take_commands();
        let mut machine = PipelineCommunicate::new(commands);
        let groups = self.pump(&mut machine)?;
        self.pipeline_absorb(groups)
    }

    fn pipeline_absorb(&mut self, groups: Vec<Vec<PqResult>>) -> Result<()> {
        let Some(state) = self.session.pipeline.as_mut() else {
            return Ok(());
        };
        let prepared = state.absorb(groups)?;
        for (key, name) in prepared {
            self.session.prepare.seen(key, &Decision::Should(name));
        }
        Ok(())
    }

    /// Drain the pipeline until the group for `ticket` has arrived.
    pub(crate) fn pipeline_fetch(&mut self, ticket: usize) -> Result<Vec<PqResult>> {
        let mut groups = self.pipeline_fetch_batch(&[ticket])?;
        groups.pop().ok_or_else(|| {
            Error::Internal(format!("pipeline ticket {ticket} redeemed twice"))
        })
    }

    /// Drain the pipeline until every ticket in `tickets` has arrived.
    ///
    /// All queued commands go out first; one flush request then forces the
    /// server to answer without a synchronization point, so a whole batch
    /// costs a single round trip.
    pub(crate) fn pipeline_fetch_batch(
        &mut self,
        tickets: &[usize],
    ) -> Result<Vec<Vec<PqResult>>> {
        self.pipeline_communicate()?;
        loop {
            let Some(state) = self.session.pipeline.as_ref() else {
                return Err(Error::Internal("no pipeline is active".into()));
            };
            let missing = tickets
                .iter()
                .filter(|ticket| !state.is_fetched(**ticket))
                .count();
            if missing == 0 {
                break;
            }
            self.transport_mut()?.send_flush_request()?;
            let mut flush = machine::Send::new();
            self.pump(&mut flush)?;
            let mut fetch = FetchGroups::new(missing);
            let groups = self.pump(&mut fetch)?;
            self.pipeline_absorb(groups)?;
        }
        let Some(state) = self.session.pipeline.as_mut() else {
            return Err(Error::Internal("no pipeline is active".into()));
        };
        tickets
            .iter()
            .map(|ticket| {
                state.take(*ticket).ok_or_else(|| {
                    Error::Internal(format!("pipeline ticket {ticket} redeemed twice"))
                })
            })
            .collect()
    }

    fn leave_pipeline(&mut self) -> Result<()> {
        if let Some(state) = self.session.pipeline.as_mut() {
            state.enqueue_sync();
        }
        self.pipeline_communicate()?;
        loop {
            let pending = self
                .session
                .pipeline
                .as_ref()
                .map_or(0, PipelineState::pending_slots);
            if pending == 0 {
                break;
            }
            let mut fetch = FetchGroups::new(pending);
            let groups = self.pump(&mut fetch)?;
            self.pipeline_absorb(groups)?;
        }
        self.session.pipeline = None;
        self.session.begin_pending = false;
        self.transport_mut()?.exit_pipeline_mode()?;
        Ok(())
    }
}

impl<C: Transport> Drop for Connection<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::StatementKey;
    use crate::transport::lab::{LabStep, LabTransport, SentCommand};
    use crate::transport::{ColumnDescription, ConnStatus};
    use std::sync::Arc;

    fn ok_result() -> PqResult {
        PqResult::with_status(ExecStatus::CommandOk)
    }

    #[test]
    fn exec_command_routes_by_parameters() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.exec_command("SELECT 1", vec![]).unwrap();
        conn.exec_command("SELECT $1", vec![Param::text("x", 0)])
            .unwrap();
        let sent = control.sent();
        assert!(matches!(sent[0], SentCommand::Query(_)));
        assert!(matches!(sent[1], SentCommand::QueryParams { .. }));
    }

    #[test]
    fn exec_command_raises_server_errors() {
        let (transport, control) = LabTransport::pair();
        let mut failed = PqResult::with_status(ExecStatus::FatalError);
        failed.error = Some(crate::ServerError::new("syntax error", "42601"));
        control.script_results([failed]);
        let mut conn = Connection::wrap(transport);
        let err = conn.exec_command("SELEC 1", vec![]).unwrap_err();
        assert_eq!(err.sqlstate(), Some("42601"));
    }

    #[test]
    fn commit_is_a_noop_when_idle() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.commit().unwrap();
        assert!(control.sent().is_empty());
    }

    #[test]
    fn commit_runs_in_a_transaction_block() {
        let (transport, control) = LabTransport::pair();
        control.set_transaction_status(TransactionStatus::InTransaction);
        let mut conn = Connection::wrap(transport);
        conn.commit().unwrap();
        assert_eq!(control.sent(), vec![SentCommand::Query("COMMIT".into())]);
    }

    #[test]
    fn rollback_clears_the_statement_cache() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let key = StatementKey::new("q", vec![]);
        conn.session.prepare.set_threshold(Some(0));
        let decision = conn.session.prepare.get(&key);
        conn.session.prepare.seen(key.clone(), &decision);
        control.set_transaction_status(TransactionStatus::InError);
        conn.rollback().unwrap();
        control.set_transaction_status(TransactionStatus::Idle);
        assert!(matches!(conn.session.prepare.get(&key), Decision::Should(_)));
    }

    #[test]
    fn discard_all_tag_resets_the_cache_quietly() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let key = StatementKey::new("q", vec![]);
        conn.session.prepare.set_threshold(Some(0));
        let decision = conn.session.prepare.get(&key);
        conn.session.prepare.seen(key, &decision);
        control.script_results([{
            let mut res = ok_result();
            res.command_tag = Some("DISCARD ALL".into());
            res
        }]);
        conn.exec_command("DISCARD ALL", vec![]).unwrap();
        // No deallocation is queued for statements the server dropped.
        control.clear_sent();
        conn.run_maintenance().unwrap();
        assert!(control.sent().is_empty());
    }

    #[test]
    fn settings_are_refused_in_a_transaction() {
        let (transport, control) = LabTransport::pair();
        control.set_transaction_status(TransactionStatus::InTransaction);
        let mut conn = Connection::wrap(transport);
        let err = conn.set_autocommit(true).unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
        let err = conn
            .set_isolation_level(Some(IsolationLevel::Serializable))
            .unwrap_err();
        assert!(err.to_string().contains("isolation_level"));
    }

    #[test]
    fn begin_statement_is_rebuilt_after_setting_changes() {
        let (transport, _control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.set_isolation_level(Some(IsolationLevel::Serializable))
            .unwrap();
        conn.set_read_only(Some(true)).unwrap();
        assert_eq!(
            conn.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY"
        );
        conn.set_read_only(None).unwrap();
        assert_eq!(conn.begin_statement(), "BEGIN ISOLATION LEVEL SERIALIZABLE");
    }

    #[test]
    fn close_is_idempotent() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(control.finished());
        assert!(matches!(
            conn.exec_command("SELECT 1", vec![]),
            Err(Error::Operational(_))
        ));
    }

    #[test]
    fn transaction_block_commits_on_success() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.transaction(|conn| conn.exec_command("INSERT", vec![]).map(drop))
            .unwrap();
        assert_eq!(
            control.sent(),
            vec![
                SentCommand::Query("BEGIN".into()),
                SentCommand::Query("INSERT".into()),
                SentCommand::Query("COMMIT".into()),
            ]
        );
    }

    #[test]
    fn transaction_block_rolls_back_on_error() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let err = conn
            .transaction::<()>(|_| Err(Error::Programming("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Programming(_)));
        assert_eq!(
            control.sent(),
            vec![
                SentCommand::Query("BEGIN".into()),
                SentCommand::Query("ROLLBACK".into()),
            ]
        );
    }

    #[test]
    fn nested_transaction_uses_savepoints() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.transaction(|conn| {
            let inner: Result<()> =
                conn.transaction(|_| Err(Error::Programming("inner".into())));
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            control.sent(),
            vec![
                SentCommand::Query("BEGIN".into()),
                SentCommand::Query("SAVEPOINT \"_pg_savepoint_1\"".into()),
                SentCommand::Query("ROLLBACK TO SAVEPOINT \"_pg_savepoint_1\"".into()),
                SentCommand::Query("COMMIT".into()),
            ]
        );
    }

    #[test]
    fn commit_inside_transaction_block_is_refused() {
        let (transport, _control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let result = conn.transaction(|conn| conn.commit());
        assert!(matches!(result, Err(Error::Programming(_))));
    }

    #[test]
    fn tpc_full_cycle_uses_quoted_xid() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let xid = crate::tpc::Xid::new(1, "tx", "br").unwrap();
        conn.tpc_begin(xid.clone()).unwrap();
        conn.tpc_prepare().unwrap();
        conn.tpc_commit(None).unwrap();
        let sent = control.sent();
        assert_eq!(sent[0], SentCommand::Query("BEGIN".into()));
        assert_eq!(
            sent[1],
            SentCommand::Query(format!("PREPARE TRANSACTION '{xid}'"))
        );
        assert_eq!(
            sent[2],
            SentCommand::Query(format!("COMMIT PREPARED '{xid}'"))
        );
    }

    #[test]
    fn commit_is_refused_after_tpc_prepare() {
        let (transport, _control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.tpc_begin(crate::tpc::Xid::from_string("t1")).unwrap();
        conn.tpc_prepare().unwrap();
        assert!(matches!(conn.commit(), Err(Error::Programming(_))));
        conn.tpc_rollback(None).unwrap();
    }

    #[test]
    fn tpc_one_phase_commit_skips_prepared_form() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.tpc_begin(crate::tpc::Xid::from_string("t1")).unwrap();
        conn.tpc_commit(None).unwrap();
        let sent = control.sent();
        assert_eq!(sent[1], SentCommand::Query("COMMIT".into()));
    }

    #[test]
    fn tpc_recover_preserves_an_open_transaction() {
        let (transport, control) = LabTransport::pair();
        control.set_transaction_status(TransactionStatus::InTransaction);
        let columns: crate::transport::SharedColumns = Arc::new(
            ["gid", "prepared", "owner", "database"]
                .iter()
                .map(|name| ColumnDescription {
                    name: (*name).into(),
                    type_oid: crate::adapt::oids::TEXT,
                    type_modifier: -1,
                    type_size: -1,
                    format: Format::Text,
                })
                .collect(),
        );
        let mut catalog = PqResult::with_status(ExecStatus::TuplesOk);
        catalog.columns = columns;
        catalog.rows = vec![vec![
            Some(b"1_dHg=_YnI=".to_vec()),
            Some(b"2026-08-31 12:00:00".to_vec()),
            Some(b"owner".to_vec()),
            Some(b"app".to_vec()),
        ]];
        control.script_results([catalog]);
        let mut conn = Connection::wrap(transport);
        let recovered = conn.tpc_recover().unwrap();
        assert_eq!(recovered.len(), 1);
        // The caller's transaction is not ours to roll back.
        assert!(!control
            .sent()
            .iter()
            .any(|cmd| matches!(cmd, SentCommand::Query(q) if q == "ROLLBACK")));
    }

    #[test]
    fn notify_backlog_drains_before_waiting() {
        let (transport, control) = LabTransport::pair();
        control.push_notify(Notify {
            channel: "jobs".into(),
            payload: "1".into(),
            backend_pid: 7,
        });
        let mut conn = Connection::wrap(transport);
        // The sweep after any pumped operation picks the notification up.
        conn.exec_command("SELECT 1", vec![]).unwrap();
        let batch = conn.notifies(Some(Duration::ZERO)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].channel, "jobs");
    }

    #[test]
    fn notify_handlers_observe_swept_notifications() {
        use std::cell::Cell;
        use std::rc::Rc;

        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let seen = Rc::new(Cell::new(0));
        let counter = Rc::clone(&seen);
        conn.add_notify_handler(move |_| counter.set(counter.get() + 1));
        control.push_notify(Notify {
            channel: "jobs".into(),
            payload: "1".into(),
            backend_pid: 7,
        });
        conn.exec_command("SELECT 1", vec![]).unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn pipeline_queues_and_drains_at_exit() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        conn.pipeline(|conn| {
            conn.exec_command("SELECT 1", vec![])?;
            conn.exec_command("SELECT 2", vec![])?;
            assert!(control.sent().is_empty());
            // Groups answering the two commands, then the sync marker.
            control.push(LabStep::Result(ok_result()));
            control.push(LabStep::Done);
            control.push(LabStep::Result(ok_result()));
            control.push(LabStep::Done);
            control.push(LabStep::Result(PqResult::with_status(
                ExecStatus::PipelineSync,
            )));
            Ok(())
        })
        .unwrap();
        let sent = control.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], SentCommand::PipelineSync);
        assert!(!control.in_pipeline_mode());
    }

    #[test]
    fn pipeline_surfaces_unclaimed_errors_at_exit() {
        let (transport, control) = LabTransport::pair();
        let mut conn = Connection::wrap(transport);
        let result = conn.pipeline(|conn| {
            conn.exec_command("SELEC 1", vec![])?;
            let mut failed = PqResult::with_status(ExecStatus::FatalError);
            failed.error = Some(crate::ServerError::new("syntax error", "42601"));
            control.push(LabStep::Result(failed));
            control.push(LabStep::Done);
            control.push(LabStep::Result(PqResult::with_status(
                ExecStatus::PipelineSync,
            )));
            Ok(())
        });
        assert!(matches!(result, Err(Error::Server(_))));
    }

    #[test]
    fn connection_status_survives_wrap() {
        let (transport, _control) = LabTransport::pair();
        assert_eq!(transport.status(), ConnStatus::Ok);
        let conn = Connection::wrap(transport);
        assert_eq!(conn.server_version(), Some(160002));
        assert_eq!(conn.backend_pid(), Some(4242));
    }
}

//! Asynchronous connection façade.
//!
//! The same [`SessionCore`] and machines as the blocking flavor, pumped by
//! [`crate::waiting::tokio::wait`]. Transaction and pipeline scopes take
//! async closures; everything else mirrors the blocking API method for
//! method.

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
use crate::prepare::{Decision, Maintenance};
use crate::session::{
    closed, quote_ident, quote_literal, IsolationLevel, SessionCore, TpcState,
    CLOSE_PREPARED_VERSION,
};
use crate::transport::{
    CancelRequest as _, ExecStatus, Format, Notify, PqResult, TransactionStatus, Transport,
};
use crate::waiting;

/// A PostgreSQL session over a non-blocking transport, awaited instead of
/// blocked on.
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
    pub async fn connect(dsn: &str) -> Result<Self> {
        Self::connect_conninfo(&Conninfo::parse(dsn)?).await
    }

    /// Connect using an already-parsed parameter map.
    pub async fn connect_conninfo(info: &Conninfo) -> Result<Self> {
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
            match waiting::tokio::wait(&mut machine, &mut transport).await {
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
    pub(crate) async fn pump<M: Machine<C>>(&mut self, machine: &mut M) -> Result<M::Output> {
        let transport = self.transport.as_mut().ok_or_else(closed)?;
        let output = waiting::tokio::wait(machine, transport).await;
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
    pub(crate) async fn exec_command(
        &mut self,
        sql: &str,
        params: Vec<Param>,
    ) -> Result<Vec<PqResult>> {
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
        let results = self.pump(&mut machine).await?;
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
    pub(crate) async fn run_maintenance(&mut self) -> Result<()> {
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
                        self.pump(&mut machine).await?;
                    } else {
                        self.exec_command(&format!("DEALLOCATE {}", quote_ident(&name)), vec![])
                            .await?;
                    }
                }
                Maintenance::DeallocateAll => {
                    self.exec_command("DEALLOCATE ALL", vec![]).await?;
                }
            }
        }
        Ok(())
    }

    /// Open a transaction block if the session needs one for the next
    /// statement.
    pub(crate) async fn ensure_transaction(&mut self) -> Result<()> {
        if self.session.autocommit || self.session.begin_pending {
            return Ok(());
        }
        if self.transaction_status() != TransactionStatus::Idle {
            return Ok(());
        }
        let begin = self.session.begin_statement();
        self.exec_command(&begin, vec![]).await?;
        if self.session.pipeline.is_some() {
            // The queued BEGIN has not run yet; don't queue another.
            self.session.begin_pending = true;
        }
        Ok(())
    }

    /// Commit the current transaction. A no-op when idle.
    pub async fn commit(&mut self) -> Result<()> {
        self.session.ensure_finishable("commit")?;
        if self.session.pipeline.is_none()
            && self.transaction_status() == TransactionStatus::Idle
        {
            return Ok(());
        }
        self.exec_command("COMMIT", vec![]).await?;
        self.session.begin_pending = false;
        Ok(())
    }

    /// Roll back the current transaction. A no-op when idle.
    pub async fn rollback(&mut self) -> Result<()> {
        self.session.ensure_finishable("rollback")?;
        if self.session.pipeline.is_none()
            && self.transaction_status() == TransactionStatus::Idle
        {
            return Ok(());
        }
        self.exec_command("ROLLBACK", vec![]).await?;
        self.session.begin_pending = false;
        self.session.prepare.clear();
        Ok(())
    }

    /// Run `f` inside a transaction block.
    ///
    /// The outermost call brackets `f` with BEGIN and COMMIT; nested calls
    /// use savepoints. An error from `f` rolls back to the start of the
    /// block and is returned unchanged.
    pub async fn transaction<T>(
        &mut self,
        f: impl AsyncFnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let savepoint = if self.session.tx_depth == 0
            && self.transaction_status() == TransactionStatus::Idle
        {
            let begin = self.session.begin_statement();
            self.exec_command(&begin, vec![]).await?;
            None
        } else {
            let name = format!("_pg_savepoint_{}", self.session.tx_depth);
            self.exec_command(&format!("SAVEPOINT {}", quote_ident(&name)), vec![])
                .await?;
            Some(name)
        };
        self.session.tx_depth += 1;
        let result = f(self).await;
        self.session.tx_depth -= 1;
        match result {
            Ok(value) => {
                match &savepoint {
                    None => self.exec_command("COMMIT", vec![]).await?,
                    Some(name) => {
                        self.exec_command(
                            &format!("RELEASE SAVEPOINT {}", quote_ident(name)),
                            vec![],
                        )
                        .await?
                    }
                };
                Ok(value)
            }
            Err(err) => {
                let rollback = match &savepoint {
                    None => "ROLLBACK".to_string(),
                    Some(name) => format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)),
                };
                if let Err(rb_err) = self.exec_command(&rollback, vec![]).await {
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
    pub async fn cancel_safe(&mut self, timeout: Option<Duration>) -> Result<()> {
        let Some(transport) = self.transport.as_ref() else {
            return Ok(());
        };
        let mut request = transport.cancel_conn()?;
        if !transport.supports_cancel_safe() {
            return request.cancel_blocking();
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut machine = Cancel::new(deadline);
        waiting::tokio::wait(&mut machine, &mut request).await
    }

    /// Wait for notifications, draining any backlog first.
    ///
    /// Returns an empty batch when the timeout expires.
    pub async fn notifies(&mut self, timeout: Option<Duration>) -> Result<Vec<Notify>> {
        if !self.session.notify_backlog.is_empty() {
            return Ok(self.session.notify_backlog.drain(..).collect());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut machine = Notifies::new(deadline);
        let transport = self.transport.as_mut().ok_or_else(closed)?;
        let batch = waiting::tokio::wait(&mut machine, transport).await?;
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
    pub fn cursor(&mut self) -> super::Cursor<'_, C> {
        super::Cursor::new(self)
    }

    /// A named server-side cursor on this connection.
    pub fn server_cursor(&mut self, name: impl Into<String>) -> super::ServerCursor<'_, C> {
        super::ServerCursor::new(self, name)
    }

    // Two-phase commit.

    /// Begin a distributed transaction under `xid`.
    pub async fn tpc_begin(&mut self, xid: crate::tpc::Xid) -> Result<()> {
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
        self.exec_command(&begin, vec![]).await?;
        self.session.tpc = Some(TpcState {
            xid,
            prepared: false,
        });
        Ok(())
    }

    /// First phase: persist the transaction under its xid.
    pub async fn tpc_prepare(&mut self) -> Result<()> {
        let Some(tpc) = self.session.tpc.as_ref() else {
            return Err(Error::Programming(
                "tpc_prepare() requires tpc_begin() first".into(),
            ));
        };
        let sql = format!("PREPARE TRANSACTION {}", quote_literal(&tpc.xid.to_string()));
        self.exec_command(&sql, vec![]).await?;
        if let Some(tpc) = self.session.tpc.as_mut() {
            tpc.prepared = true;
        }
        Ok(())
    }

    /// Second phase: commit, either our own transaction or a recovered xid.
    pub async fn tpc_commit(&mut self, xid: Option<&crate::tpc::Xid>) -> Result<()> {
        self.tpc_finish(xid, "COMMIT PREPARED", "COMMIT").await
    }

    /// Second phase: roll back, either our own transaction or a recovered
    /// xid.
    pub async fn tpc_rollback(&mut self, xid: Option<&crate::tpc::Xid>) -> Result<()> {
        self.tpc_finish(xid, "ROLLBACK PREPARED", "ROLLBACK").await
    }

    async fn tpc_finish(
        &mut self,
        xid: Option<&crate::tpc::Xid>,
        prepared_verb: &str,
        verb: &str,
    ) -> Result<()> {
        match xid {
            Some(xid) => {
                if self.transaction_status() != TransactionStatus::Idle {
                    return Err(Error::Programming(format!(
                        "{verb} of a recovered transaction requires an idle connection"
                    )));
                }
                let sql = format!("{prepared_verb} {}", quote_literal(&xid.to_string()));
                self.exec_command(&sql, vec![]).await?;
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
                    self.exec_command(&sql, vec![]).await?;
                } else {
                    // One-phase optimization: never prepared, plain finish.
                    self.exec_command(verb, vec![]).await?;
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
    pub async fn tpc_recover(&mut self) -> Result<Vec<crate::tpc::PreparedTransaction>> {
        let was_idle = self.transaction_status() == TransactionStatus::Idle;
        let results = self
            .exec_command(
                "SELECT gid, prepared::text, owner, database FROM pg_prepared_xacts",
                vec![],
            )
            .await?;
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
            if let Err(err) = self.exec_command("ROLLBACK", vec![]).await {
                warn!(error = %err, "rollback after recovery query failed");
            }
        }
        Ok(recovered)
    }

    // Pipeline scope.

    /// Run `f` with this connection in pipeline mode.
    pub async fn pipeline<T>(
        &mut self,
        f: impl AsyncFnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if self.session.pipeline_depth == 0 {
            self.transport_mut()?.enter_pipeline_mode()?;
            self.session.pipeline = Some(PipelineState::new());
        }
        self.session.pipeline_depth += 1;
        let result = f(self).await;
        self.session.pipeline_depth -= 1;
        if self.session.pipeline_depth > 0 {
            if result.is_ok()
                && let Some(state) = self.session.pipeline.as_mut()
            {
                state.enqueue_sync();
            }
            return result;
        }
        match self.leave_pipeline().await {
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
        prepare: Option<(crate::prepare::StatementKey, String)>,
        wants_results: bool,
    ) -> Result<Option<usize>> {
        let Some(state) = self.session.pipeline.as_mut() else {
            return Err(Error::Internal("no pipeline is active".into()));
        };
        Ok(state.enqueue(command, prepare, wants_results))
    }

    /// Push queued commands to the server, absorbing early result groups.
    async fn pipeline_communicate(&mut self) -> Result<()> {
        let Some(state) = self.session.pipeline.as_mut() else {
            return Ok(());
        };
        if !state.has_commands() {
            return Ok(());
        }
        let commands = state.take_commands();
        let mut machine = PipelineCommunicate::new(commands);
        let groups = self.pump(&mut machine).await?;
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
    pub(crate) async fn pipeline_fetch(&mut self, ticket: usize) -> Result<Vec<PqResult>> {
        let mut groups = self.pipeline_fetch_batch(&[ticket]).await?;
        groups.pop().ok_or_else(|| {
            Error::Internal(format!("pipeline ticket {ticket} redeemed twice"))
        })
    }

    /// Drain the pipeline until every ticket in `tickets` has arrived.
    ///
    /// All queued commands go out first; one flush request then forces the
    /// server to answer without a synchronization point, so a whole batch
    /// costs a single round trip.
    pub(crate) async fn pipeline_fetch_batch(
        &mut self,
        tickets: &[usize],
    ) -> Result<Vec<Vec<PqResult>>> {
        self.pipeline_communicate().await?;
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
            self.pump(&mut flush).await?;
            let mut fetch = FetchGroups::new(missing);
            let groups = self.pump(&mut fetch).await?;
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

    async fn leave_pipeline(&mut self) -> Result<()> {
        if let Some(state) = self.session.pipeline.as_mut() {
            state.enqueue_sync();
        }
        self.pipeline_communicate().await?;
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
            let groups = self.pump(&mut fetch).await?;
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

//! Scripted in-memory transport for driving machines in tests.
//!
//! A [`LabTransport`] replays a queue of [`LabStep`]s and records every
//! command sent through it. [`LabTransport::pair`] returns the transport
//! together with a [`LabControl`] handle sharing the same state, so a test
//! can keep feeding steps and inspecting the log while a machine or a
//! connection owns the transport.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;

use super::{
    CancelRequest, ConnStatus, CopyOutChunk, FlushStatus, Notify, Oid, PollingStatus, PqResult,
    PutStatus, Socketed, TransactionStatus, Transport,
};
use crate::adapt::Param;
use crate::error::{Error, Result};
use crate::transport::Format;

/// One scripted event on the inbound side of the transport.
#[derive(Debug, Clone)]
pub enum LabStep {
    /// Report busy until the next `consume_input` call.
    Busy,
    /// Deliver one result.
    Result(PqResult),
    /// Report the current exchange as drained (`get_result` returns `None`).
    Done,
    /// Fail the next `consume_input` call and mark the connection bad.
    Disconnect,
}

/// One command recorded on the outbound side of the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SentCommand {
    Query(String),
    QueryParams {
        sql: String,
        params: Vec<Param>,
        result_format: Format,
    },
    Prepare {
        name: String,
        sql: String,
        param_oids: Vec<Oid>,
    },
    QueryPrepared {
        name: String,
        params: Vec<Param>,
        result_format: Format,
    },
    ClosePrepared(String),
    SingleRowMode,
    ChunkedRowsMode(usize),
    CopyData(Vec<u8>),
    CopyEnd(Option<String>),
    PipelineSync,
    FlushRequest,
}

#[derive(Debug, Default)]
struct LabInner {
    steps: VecDeque<LabStep>,
    sent: Vec<SentCommand>,
    flush_script: VecDeque<FlushStatus>,
    connect_script: VecDeque<PollingStatus>,
    copy_out: VecDeque<CopyOutChunk>,
    put_script: VecDeque<PutStatus>,
    notifies: VecDeque<Notify>,
    status: Option<ConnStatus>,
    tx_status: TransactionStatus,
    server_version: u32,
    pipeline_mode: bool,
    finished: bool,
    socket: RawFd,
}

/// Test-side handle to a [`LabTransport`]'s shared state.
#[derive(Clone)]
pub struct LabControl {
    inner: Rc<RefCell<LabInner>>,
}

impl LabControl {
    /// Append an inbound step to the script.
    pub fn push(&self, step: LabStep) {
        self.inner.borrow_mut().steps.push_back(step);
    }

    /// Append a full scripted exchange: the given results, then drained.
    pub fn script_results(&self, results: impl IntoIterator<Item = PqResult>) {
        let mut inner = self.inner.borrow_mut();
        for res in results {
            inner.steps.push_back(LabStep::Result(res));
        }
        inner.steps.push_back(LabStep::Done);
    }

    /// Script the outcomes of upcoming `flush` calls.
    pub fn script_flush(&self, statuses: impl IntoIterator<Item = FlushStatus>) {
        self.inner.borrow_mut().flush_script.extend(statuses);
    }

    /// Script the connect handshake polling sequence.
    pub fn script_connect(&self, statuses: impl IntoIterator<Item = PollingStatus>) {
        self.inner.borrow_mut().connect_script.extend(statuses);
    }

    /// Queue COPY OUT chunks to be read back.
    pub fn script_copy_out(&self, chunks: impl IntoIterator<Item = CopyOutChunk>) {
        self.inner.borrow_mut().copy_out.extend(chunks);
    }

    /// Script the outcomes of upcoming `put_copy_data`/`put_copy_end` calls.
    pub fn script_put(&self, statuses: impl IntoIterator<Item = PutStatus>) {
        self.inner.borrow_mut().put_script.extend(statuses);
    }

    /// Buffer a notification for `take_notify`.
    pub fn push_notify(&self, notify: Notify) {
        self.inner.borrow_mut().notifies.push_back(notify);
    }

    /// Override the reported transaction status.
    pub fn set_transaction_status(&self, status: TransactionStatus) {
        self.inner.borrow_mut().tx_status = status;
    }

    /// Override the reported server version.
    pub fn set_server_version(&self, version: u32) {
        self.inner.borrow_mut().server_version = version;
    }

    /// Commands sent so far, in order.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.inner.borrow().sent.clone()
    }

    /// Drop the recorded command log.
    pub fn clear_sent(&self) {
        self.inner.borrow_mut().sent.clear();
    }

    /// Whether the transport is currently in pipeline mode.
    pub fn in_pipeline_mode(&self) -> bool {
        self.inner.borrow().pipeline_mode
    }

    /// Whether `finish` was called.
    pub fn finished(&self) -> bool {
        self.inner.borrow().finished
    }
}

/// Scripted transport; see the module docs.
pub struct LabTransport {
    inner: Rc<RefCell<LabInner>>,
}

impl LabTransport {
    /// A connected transport plus its control handle.
    pub fn pair() -> (Self, LabControl) {
        let inner = Rc::new(RefCell::new(LabInner {
            status: Some(ConnStatus::Ok),
            server_version: 160002,
            ..LabInner::default()
        }));
        let control = LabControl {
            inner: Rc::clone(&inner),
        };
        (Self { inner }, control)
    }

    /// A transport still mid-handshake; `connect_poll` replays the script.
    pub fn connecting() -> (Self, LabControl) {
        let (transport, control) = Self::pair();
        transport.inner.borrow_mut().status = Some(ConnStatus::Connecting);
        (transport, control)
    }

    fn record(&mut self, command: SentCommand) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.finished {
            return Err(Error::Operational("transport already closed".into()));
        }
        inner.sent.push(command);
        Ok(())
    }
}

impl Socketed for LabTransport {
    fn socket(&self) -> Result<RawFd> {
        Ok(self.inner.borrow().socket)
    }
}

impl Transport for LabTransport {
    type Cancel = LabCancel;

    fn connect_start(_params: &[(String, String)]) -> Result<Self> {
        let (transport, _) = Self::connecting();
        Ok(transport)
    }

    fn connect_poll(&mut self) -> Result<PollingStatus> {
        let mut inner = self.inner.borrow_mut();
        let status = inner.connect_script.pop_front().unwrap_or(PollingStatus::Ok);
        inner.status = Some(match status {
            PollingStatus::Ok => ConnStatus::Ok,
            PollingStatus::Failed => ConnStatus::Bad,
            _ => ConnStatus::Connecting,
        });
        Ok(status)
    }

    fn status(&self) -> ConnStatus {
        self.inner.borrow().status.unwrap_or(ConnStatus::Bad)
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.inner.borrow().tx_status
    }

    fn server_version(&self) -> u32 {
        self.inner.borrow().server_version
    }

    fn backend_pid(&self) -> u32 {
        4242
    }

    fn error_message(&self) -> String {
        String::new()
    }

    fn send_query(&mut self, sql: &str) -> Result<()> {
        self.record(SentCommand::Query(sql.into()))
    }

    fn send_query_params(
        &mut self,
        sql: &str,
        params: &[Param],
        result_format: Format,
    ) -> Result<()> {
        self.record(SentCommand::QueryParams {
            sql: sql.into(),
            params: params.to_vec(),
            result_format,
        })
    }

    fn send_prepare(&mut self, name: &str, sql: &str, param_oids: &[Oid]) -> Result<()> {
        self.record(SentCommand::Prepare {
            name: name.into(),
            sql: sql.into(),
            param_oids: param_oids.to_vec(),
        })
    }

    fn send_query_prepared(
        &mut self,
        name: &str,
        params: &[Param],
        result_format: Format,
    ) -> Result<()> {
        self.record(SentCommand::QueryPrepared {
            name: name.into(),
            params: params.to_vec(),
            result_format,
        })
    }

    fn send_close_prepared(&mut self, name: &str) -> Result<()> {
        self.record(SentCommand::ClosePrepared(name.into()))
    }

    fn set_single_row_mode(&mut self) -> Result<()> {
        self.record(SentCommand::SingleRowMode)
    }

    fn set_chunked_rows_mode(&mut self, size: usize) -> Result<()> {
        self.record(SentCommand::ChunkedRowsMode(size))
    }

    fn supports_chunked_rows(&self) -> bool {
        true
    }

    fn supports_cancel_safe(&self) -> bool {
        true
    }

    fn flush(&mut self) -> Result<FlushStatus> {
        Ok(self
            .inner
            .borrow_mut()
            .flush_script
            .pop_front()
            .unwrap_or(FlushStatus::Done))
    }

    fn consume_input(&mut self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.steps.front() {
            Some(LabStep::Busy) => {
                inner.steps.pop_front();
                Ok(())
            }
            Some(LabStep::Disconnect) => {
                inner.steps.pop_front();
                inner.status = Some(ConnStatus::Bad);
                Err(Error::Operational("server closed the connection".into()))
            }
            _ => Ok(()),
        }
    }

    fn is_busy(&self) -> bool {
        matches!(
            self.inner.borrow().steps.front(),
            Some(LabStep::Busy | LabStep::Disconnect)
        )
    }

    fn get_result(&mut self) -> Result<Option<PqResult>> {
        let mut inner = self.inner.borrow_mut();
        match inner.steps.front() {
            Some(LabStep::Result(_)) => match inner.steps.pop_front() {
                Some(LabStep::Result(res)) => Ok(Some(res)),
                _ => Ok(None),
            },
            Some(LabStep::Done) => {
                inner.steps.pop_front();
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn get_copy_data(&mut self) -> Result<CopyOutChunk> {
        Ok(self
            .inner
            .borrow_mut()
            .copy_out
            .pop_front()
            .unwrap_or(CopyOutChunk::WouldBlock))
    }

    fn put_copy_data(&mut self, data: &[u8]) -> Result<PutStatus> {
        let status = self
            .inner
            .borrow_mut()
            .put_script
            .pop_front()
            .unwrap_or(PutStatus::Queued);
        if status == PutStatus::Queued {
            self.record(SentCommand::CopyData(data.to_vec()))?;
        }
        Ok(status)
    }

    fn put_copy_end(&mut self, error: Option<&str>) -> Result<PutStatus> {
        let status = self
            .inner
            .borrow_mut()
            .put_script
            .pop_front()
            .unwrap_or(PutStatus::Queued);
        if status == PutStatus::Queued {
            self.record(SentCommand::CopyEnd(error.map(str::to_owned)))?;
        }
        Ok(status)
    }

    fn enter_pipeline_mode(&mut self) -> Result<()> {
        self.inner.borrow_mut().pipeline_mode = true;
        Ok(())
    }

    fn exit_pipeline_mode(&mut self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.steps.is_empty() {
            return Err(Error::Operational(
                "cannot exit pipeline mode with results pending".into(),
            ));
        }
        inner.pipeline_mode = false;
        Ok(())
    }

    fn pipeline_sync(&mut self) -> Result<()> {
        self.record(SentCommand::PipelineSync)
    }

    fn send_flush_request(&mut self) -> Result<()> {
        self.record(SentCommand::FlushRequest)
    }

    fn take_notify(&mut self) -> Option<Notify> {
        self.inner.borrow_mut().notifies.pop_front()
    }

    fn cancel_conn(&self) -> Result<Self::Cancel> {
        Ok(LabCancel {
            script: VecDeque::from([PollingStatus::Ok]),
            delivered: false,
        })
    }

    fn finish(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.finished = true;
        inner.status = Some(ConnStatus::Bad);
    }
}

/// Scripted cancellation handle.
pub struct LabCancel {
    script: VecDeque<PollingStatus>,
    delivered: bool,
}

impl LabCancel {
    /// Whether the cancel request reached the server.
    pub fn delivered(&self) -> bool {
        self.delivered
    }
}

impl Socketed for LabCancel {
    fn socket(&self) -> Result<RawFd> {
        Ok(0)
    }
}

impl CancelRequest for LabCancel {
    fn cancel_blocking(&mut self) -> Result<()> {
        self.delivered = true;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll(&mut self) -> Result<PollingStatus> {
        let status = self.script.pop_front().unwrap_or(PollingStatus::Ok);
        if status == PollingStatus::Ok {
            self.delivered = true;
        }
        Ok(status)
    }
}

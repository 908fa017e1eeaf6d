use std::collections::VecDeque;
use std::mem;

use tracing::trace;

use super::{Machine, Ready, Step, Wait};
use crate::adapt::Param;
use crate::error::{Error, Result};
use crate::transport::{ExecStatus, FlushStatus, Format, Oid, PqResult, Transport};

/// One command queued for a pipeline round-trip.
///
/// Pipeline mode only speaks the extended sub-protocol, so there is no
/// simple-query variant.
#[derive(Debug, Clone)]
pub enum QueuedCommand {
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
    ClosePrepared {
        name: String,
    },
    Sync,
}

fn send_command<C: Transport>(conn: &mut C, command: QueuedCommand) -> Result<()> {
    match command {
        QueuedCommand::QueryParams {
            sql,
            params,
            result_format,
        } => conn.send_query_params(&sql, &params, result_format),
        QueuedCommand::Prepare {
            name,
            sql,
            param_oids,
        } => conn.send_prepare(&name, &sql, &param_oids),
        QueuedCommand::QueryPrepared {
            name,
            params,
            result_format,
        } => conn.send_query_prepared(&name, &params, result_format),
        QueuedCommand::ClosePrepared { name } => conn.send_close_prepared(&name),
        QueuedCommand::Sync => conn.pipeline_sync(),
    }
}

/// Pushes queued pipeline commands to the server while opportunistically
/// harvesting whatever result groups have already come back.
///
/// Completes once every queued command is sent and flushed; results still
/// in flight are left for [`FetchGroups`]. A result group is one command's
/// results, closed by the inter-result gap; a synchronization point forms a
/// single-element group of its own.
pub struct PipelineCommunicate {
    commands: VecDeque<QueuedCommand>,
    groups: Vec<Vec<PqResult>>,
    current: Vec<PqResult>,
}

impl PipelineCommunicate {
    pub fn new(commands: VecDeque<QueuedCommand>) -> Self {
        Self {
            commands,
            groups: Vec::new(),
            current: Vec::new(),
        }
    }
}

fn harvest<C: Transport>(
    conn: &mut C,
    groups: &mut Vec<Vec<PqResult>>,
    current: &mut Vec<PqResult>,
) -> Result<()> {
    conn.consume_input()?;
    while !conn.is_busy() {
        match conn.get_result()? {
            None => {
                // A gap with nothing collected means the inbound side is
                // drained for now.
                if current.is_empty() {
                    break;
                }
                groups.push(mem::take(current));
            }
            Some(res) => {
                if res.status.is_copy() {
                    return Err(Error::NotSupported(
                        "COPY cannot be used in pipeline mode".into(),
                    ));
                }
                if res.status == ExecStatus::PipelineSync {
                    if !current.is_empty() {
                        groups.push(mem::take(current));
                    }
                    groups.push(vec![res]);
                } else {
                    current.push(res);
                }
            }
        }
    }
    Ok(())
}

impl<C: Transport> Machine<C> for PipelineCommunicate {
    type Output = Vec<Vec<PqResult>>;

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<Self::Output>> {
        if ready.readable() {
            harvest(conn, &mut self.groups, &mut self.current)?;
        }
        while let Some(command) = self.commands.pop_front() {
            send_command(conn, command)?;
        }
        match conn.flush()? {
            FlushStatus::Pending => Ok(Step::Pending(Wait::ReadWrite)),
            FlushStatus::Done => {
                trace!(groups = self.groups.len(), "pipeline commands flushed");
                Ok(Step::Ready(mem::take(&mut self.groups)))
            }
        }
    }
}

/// Harvests a fixed number of pipeline result groups.
///
/// Used to drain outstanding results after a flush request or a
/// synchronization point; `want` counts synchronization groups too.
pub struct FetchGroups {
    want: usize,
    groups: Vec<Vec<PqResult>>,
    current: Vec<PqResult>,
}

impl FetchGroups {
    pub fn new(want: usize) -> Self {
        Self {
            want,
            groups: Vec::new(),
            current: Vec::new(),
        }
    }
}

impl<C: Transport> Machine<C> for FetchGroups {
    type Output = Vec<Vec<PqResult>>;

    fn resume(&mut self, conn: &mut C, _ready: Ready) -> Result<Step<Self::Output>> {
        loop {
            if self.groups.len() >= self.want {
                return Ok(Step::Ready(mem::take(&mut self.groups)));
            }
            if conn.is_busy() {
                conn.consume_input()?;
                if conn.is_busy() {
                    return Ok(Step::Pending(Wait::Read));
                }
            }
            match conn.get_result()? {
                None => {
                    if self.current.is_empty() {
                        // Nothing buffered and nothing collected: the server
                        // has not answered yet.
                        return Ok(Step::Pending(Wait::Read));
                    }
                    self.groups.push(mem::take(&mut self.current));
                }
                Some(res) => {
                    if res.status.is_copy() {
                        return Err(Error::NotSupported(
                            "COPY cannot be used in pipeline mode".into(),
                        ));
                    }
                    if res.status == ExecStatus::PipelineSync {
                        if !self.current.is_empty() {
                            self.groups.push(mem::take(&mut self.current));
                        }
                        self.groups.push(vec![res]);
                    } else {
                        self.current.push(res);
                    }
                }
            }
        }
    }
}

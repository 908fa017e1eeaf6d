use std::mem;

use tracing::trace;

use super::{absorb_input, Machine, Ready, Step, Wait};
use crate::error::Result;
use crate::transport::{ExecStatus, PqResult, Transport};

/// Flushes buffered output to the server.
///
/// While blocked on writability it also drains inbound data, so a server
/// that stops reading until we read (both buffers full) cannot deadlock us.
#[derive(Default)]
pub struct Send;

impl Send {
    pub fn new() -> Self {
        Self
    }
}

impl<C: Transport> Machine<C> for Send {
    type Output = ();

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<()>> {
        if ready.readable() {
            conn.consume_input()?;
        }
        match conn.flush()? {
            crate::transport::FlushStatus::Done => Ok(Step::Ready(())),
            crate::transport::FlushStatus::Pending => Ok(Step::Pending(Wait::ReadWrite)),
        }
    }
}

/// Fetches a single result, or `None` when the exchange is drained.
#[derive(Default)]
pub struct Fetch;

impl Fetch {
    pub fn new() -> Self {
        Self
    }
}

impl<C: Transport> Machine<C> for Fetch {
    type Output = Option<PqResult>;

    fn resume(&mut self, conn: &mut C, _ready: Ready) -> Result<Step<Self::Output>> {
        if absorb_input(conn)? {
            Ok(Step::Ready(conn.get_result()?))
        } else {
            Ok(Step::Pending(Wait::Read))
        }
    }
}

/// Fetches every result of the current exchange.
///
/// Stops after draining the exchange, or early on a result that opens a
/// COPY sub-protocol or marks a pipeline synchronization point; those hand
/// control to a dedicated machine.
#[derive(Default)]
pub struct FetchMany {
    results: Vec<PqResult>,
}

impl FetchMany {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(&mut self) -> Step<Vec<PqResult>> {
        Step::Ready(mem::take(&mut self.results))
    }
}

impl<C: Transport> Machine<C> for FetchMany {
    type Output = Vec<PqResult>;

    fn resume(&mut self, conn: &mut C, _ready: Ready) -> Result<Step<Self::Output>> {
        loop {
            if conn.is_busy() {
                if let Err(err) = conn.consume_input() {
                    // The server may slam the door right after a FATAL
                    // error; the error result already tells the story, so
                    // surface it instead of the broken socket.
                    if err.is_transport_failure()
                        && self
                            .results
                            .last()
                            .is_some_and(|res| res.status == ExecStatus::FatalError)
                    {
                        trace!("connection lost after fatal error result");
                        return Ok(self.finish());
                    }
                    return Err(err);
                }
                if conn.is_busy() {
                    return Ok(Step::Pending(Wait::Read));
                }
            }
            match conn.get_result()? {
                None => return Ok(self.finish()),
                Some(res) => {
                    let stop =
                        res.status.is_copy() || res.status == ExecStatus::PipelineSync;
                    self.results.push(res);
                    if stop {
                        return Ok(self.finish());
                    }
                }
            }
        }
    }
}

enum ExecutePhase {
    Sending(Send),
    Fetching(FetchMany),
}

/// Sends buffered commands, then fetches every result of the exchange.
pub struct Execute {
    phase: ExecutePhase,
}

impl Execute {
    pub fn new() -> Self {
        Self {
            phase: ExecutePhase::Sending(Send::new()),
        }
    }
}

impl Default for Execute {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Transport> Machine<C> for Execute {
    type Output = Vec<PqResult>;

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<Self::Output>> {
        loop {
            match &mut self.phase {
                ExecutePhase::Sending(send) => match send.resume(conn, ready)? {
                    Step::Pending(wait) => return Ok(Step::Pending(wait)),
                    Step::Ready(()) => {
                        self.phase = ExecutePhase::Fetching(FetchMany::new());
                    }
                },
                ExecutePhase::Fetching(fetch) => return fetch.resume(conn, ready),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testing::complete;
    use crate::transport::lab::{LabStep, LabTransport};
    use crate::transport::FlushStatus;
    use crate::ServerError;

    fn ok_result() -> PqResult {
        PqResult::with_status(ExecStatus::CommandOk)
    }

    #[test]
    fn send_retries_until_flushed() {
        let (mut conn, control) = LabTransport::pair();
        control.script_flush([FlushStatus::Pending, FlushStatus::Pending, FlushStatus::Done]);
        let mut machine = Send::new();
        complete(&mut machine, &mut conn).unwrap();
    }

    #[test]
    fn fetch_waits_out_busy_rounds() {
        let (mut conn, control) = LabTransport::pair();
        control.push(LabStep::Busy);
        control.push(LabStep::Busy);
        control.push(LabStep::Result(ok_result()));
        let mut machine = Fetch::new();
        let res = complete(&mut machine, &mut conn).unwrap();
        assert_eq!(res.map(|r| r.status), Some(ExecStatus::CommandOk));
    }

    #[test]
    fn fetch_many_collects_until_drained() {
        let (mut conn, control) = LabTransport::pair();
        control.script_results([ok_result(), ok_result()]);
        let mut machine = FetchMany::new();
        let results = complete(&mut machine, &mut conn).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn fetch_many_stops_at_copy_start() {
        let (mut conn, control) = LabTransport::pair();
        control.push(LabStep::Result(ok_result()));
        control.push(LabStep::Result(PqResult::with_status(ExecStatus::CopyOut)));
        // Anything after the COPY start belongs to the copy machine.
        control.push(LabStep::Result(ok_result()));
        let mut machine = FetchMany::new();
        let results = complete(&mut machine, &mut conn).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].status, ExecStatus::CopyOut);
    }

    #[test]
    fn fetch_many_keeps_fatal_result_on_disconnect() {
        let (mut conn, control) = LabTransport::pair();
        let mut fatal = PqResult::with_status(ExecStatus::FatalError);
        fatal.error = Some(ServerError::new("terminating connection", "57P01"));
        control.push(LabStep::Result(fatal));
        control.push(LabStep::Busy);
        control.push(LabStep::Disconnect);
        let mut machine = FetchMany::new();
        let results = complete(&mut machine, &mut conn).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ExecStatus::FatalError);
    }

    #[test]
    fn fetch_many_propagates_disconnect_without_fatal() {
        let (mut conn, control) = LabTransport::pair();
        control.push(LabStep::Result(ok_result()));
        control.push(LabStep::Busy);
        control.push(LabStep::Disconnect);
        let mut machine = FetchMany::new();
        let err = complete(&mut machine, &mut conn).unwrap_err();
        assert!(err.is_transport_failure());
    }

    #[test]
    fn execute_sends_then_fetches() {
        let (mut conn, control) = LabTransport::pair();
        control.script_flush([FlushStatus::Pending, FlushStatus::Done]);
        control.script_results([ok_result()]);
        let mut machine = Execute::new();
        let results = complete(&mut machine, &mut conn).unwrap();
        assert_eq!(results.len(), 1);
    }
}

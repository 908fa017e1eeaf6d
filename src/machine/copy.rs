use super::{Machine, Ready, Send, Step, Wait};
use crate::error::{Error, Result};
use crate::machine::FetchMany;
use crate::transport::{CopyOutChunk, PqResult, PutStatus, Transport};

/// A COPY statement runs alone, so its drained exchange holds exactly one
/// result. Anything else means the stream and the results went out of step.
fn single_copy_result(mut results: Vec<PqResult>, what: &str) -> Result<PqResult> {
    match results.len() {
        1 => Ok(results.remove(0)),
        0 => Err(Error::Operational(format!(
            "no result at the end of {what}"
        ))),
        n => Err(Error::Operational(format!(
            "{n} results at the end of {what}; expected one"
        ))),
    }
}

/// One step of a COPY TO STDOUT stream.
#[derive(Debug)]
pub enum CopyOutput {
    /// A chunk of copy data.
    Data(Vec<u8>),
    /// Stream finished; the final result of the COPY statement.
    Done(PqResult),
}

enum OutPhase {
    Data,
    Final(FetchMany),
}

/// Reads the next chunk of a COPY TO STDOUT stream.
///
/// Run repeatedly until it yields [`CopyOutput::Done`]; the machine then
/// also drains the exchange behind the final result.
pub struct CopyOut {
    phase: OutPhase,
}

impl CopyOut {
    pub fn new() -> Self {
        Self {
            phase: OutPhase::Data,
        }
    }
}

impl Default for CopyOut {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Transport> Machine<C> for CopyOut {
    type Output = CopyOutput;

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<CopyOutput>> {
        loop {
            match &mut self.phase {
                OutPhase::Data => {
                    if ready.readable() {
                        conn.consume_input()?;
                    }
                    match conn.get_copy_data()? {
                        CopyOutChunk::Data(chunk) => {
                            return Ok(Step::Ready(CopyOutput::Data(chunk)));
                        }
                        CopyOutChunk::WouldBlock => return Ok(Step::Pending(Wait::Read)),
                        CopyOutChunk::Done => self.phase = OutPhase::Final(FetchMany::new()),
                    }
                }
                OutPhase::Final(fetch) => {
                    return match fetch.resume(conn, ready)? {
                        Step::Pending(wait) => Ok(Step::Pending(wait)),
                        Step::Ready(results) => Ok(Step::Ready(CopyOutput::Done(
                            single_copy_result(results, "COPY OUT")?,
                        ))),
                    };
                }
            }
        }
    }
}

enum InPhase {
    Putting,
    Flushing(Send),
}

/// Queues one buffer of COPY FROM STDIN data.
///
/// With `eager_flush`, the buffer is pushed to the socket before the
/// machine completes instead of accumulating in the transport. Some
/// platforms misreport writability on a full copy buffer, so macOS
/// defaults to eager flushing.
pub struct CopyIn {
    data: Vec<u8>,
    eager_flush: bool,
    phase: InPhase,
}

impl CopyIn {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            eager_flush: cfg!(target_os = "macos"),
            phase: InPhase::Putting,
        }
    }

    pub fn eager_flush(mut self, eager: bool) -> Self {
        self.eager_flush = eager;
        self
    }
}

impl<C: Transport> Machine<C> for CopyIn {
    type Output = ();

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<()>> {
        loop {
            match &mut self.phase {
                InPhase::Putting => {
                    // Keep the inbound side drained while pushing; the server
                    // may interleave notices with our copy data.
                    if ready.readable() {
                        conn.consume_input()?;
                    }
                    match conn.put_copy_data(&self.data)? {
                        PutStatus::WouldBlock => return Ok(Step::Pending(Wait::ReadWrite)),
                        PutStatus::Queued => {
                            if !self.eager_flush {
                                return Ok(Step::Ready(()));
                            }
                            self.phase = InPhase::Flushing(Send::new());
                        }
                    }
                }
                InPhase::Flushing(send) => return send.resume(conn, ready),
            }
        }
    }
}

enum EndPhase {
    Ending,
    Flushing(Send),
    Fetching(FetchMany),
}

/// Terminates a COPY FROM STDIN stream and fetches the final result.
///
/// With an error message, the copy is aborted server-side instead of
/// committed.
pub struct CopyEnd {
    error: Option<String>,
    phase: EndPhase,
}

impl CopyEnd {
    pub fn new(error: Option<String>) -> Self {
        Self {
            error,
            phase: EndPhase::Ending,
        }
    }
}

impl<C: Transport> Machine<C> for CopyEnd {
    type Output = PqResult;

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<PqResult>> {
        loop {
            match &mut self.phase {
                EndPhase::Ending => {
                    if ready.readable() {
                        conn.consume_input()?;
                    }
                    match conn.put_copy_end(self.error.as_deref())? {
                        PutStatus::WouldBlock => return Ok(Step::Pending(Wait::ReadWrite)),
                        PutStatus::Queued => self.phase = EndPhase::Flushing(Send::new()),
                    }
                }
                EndPhase::Flushing(send) => match send.resume(conn, ready)? {
                    Step::Pending(wait) => return Ok(Step::Pending(wait)),
                    Step::Ready(()) => self.phase = EndPhase::Fetching(FetchMany::new()),
                },
                EndPhase::Fetching(fetch) => {
                    return match fetch.resume(conn, ready)? {
                        Step::Pending(wait) => Ok(Step::Pending(wait)),
                        Step::Ready(results) => {
                            Ok(Step::Ready(single_copy_result(results, "COPY IN")?))
                        }
                    };
                }
            }
        }
    }
}

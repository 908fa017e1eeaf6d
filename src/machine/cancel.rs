use std::time::Instant;

use super::{Machine, Ready, Step, Wait};
use crate::error::{Error, Result};
use crate::transport::{CancelRequest, PollingStatus};

/// Drives a non-blocking cancel handshake over a cancellation handle.
///
/// Runs over a [`CancelRequest`], not the primary transport: cancellation
/// travels on its own socket so it can interrupt a busy session.
#[derive(Default)]
pub struct Cancel {
    deadline: Option<Instant>,
    started: bool,
}

impl Cancel {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            started: false,
        }
    }
}

impl<R: CancelRequest> Machine<R> for Cancel {
    type Output = ();

    fn resume(&mut self, req: &mut R, _ready: Ready) -> Result<Step<()>> {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::CancellationTimeout);
        }
        if !self.started {
            req.start()?;
            self.started = true;
        }
        match req.poll()? {
            PollingStatus::Reading => Ok(Step::Pending(Wait::Read)),
            PollingStatus::Writing => Ok(Step::Pending(Wait::Write)),
            PollingStatus::Ok => Ok(Step::Ready(())),
            PollingStatus::Failed => Err(Error::Operational(
                "cancel request handshake failed".into(),
            )),
        }
    }
}

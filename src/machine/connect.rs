use std::time::Instant;

use tracing::trace;

use super::{Machine, Ready, Step, Wait};
use crate::error::{Error, Result};
use crate::transport::{ConnStatus, PollingStatus, Transport};

/// Drives an asynchronous connection handshake to completion.
///
/// The transport is created with [`Transport::connect_start`] before the
/// machine runs; this machine only polls the handshake, enforcing an
/// optional deadline across resumptions. Note the socket descriptor may
/// change between polls, so the pump re-reads it on every suspension.
pub struct Connect {
    deadline: Option<Instant>,
}

impl Connect {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline }
    }
}

impl<C: Transport> Machine<C> for Connect {
    type Output = ();

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<()>> {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(Error::ConnectionTimeout(conn.error_message()));
        }
        // Polling is non-blocking, so ticks just re-learn the wanted wait.
        match conn.connect_poll()? {
            PollingStatus::Reading => Ok(Step::Pending(Wait::Read)),
            PollingStatus::Writing => Ok(Step::Pending(Wait::Write)),
            PollingStatus::Ok => {
                if conn.status() == ConnStatus::Ok {
                    trace!(ready = ?ready, "connection handshake complete");
                    Ok(Step::Ready(()))
                } else {
                    Err(Error::Operational(conn.error_message()))
                }
            }
            PollingStatus::Failed => Err(Error::Operational(conn.error_message())),
        }
    }
}

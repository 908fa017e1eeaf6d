//! Resumable protocol machines.
//!
//! Every blocking-free operation in the driver is a [`Machine`]: a small
//! state holder whose [`resume`](Machine::resume) advances the protocol as
//! far as the transport allows, then suspends with the readiness it needs
//! next. A waiter (see [`crate::waiting`]) pumps the machine, sleeping on
//! the socket between resumptions.
//!
//! Convention: the pump first resumes with [`Ready::Timeout`] so the machine
//! makes its initial progress before any readiness is known, and machines
//! must tolerate spurious `Timeout` ticks at any suspension point.

mod cancel;
mod connect;
mod copy;
mod execute;
mod notifies;
mod pipeline;

pub use cancel::Cancel;
pub use connect::Connect;
pub use copy::{CopyEnd, CopyIn, CopyOut, CopyOutput};
pub use execute::{Execute, Fetch, FetchMany, Send};
pub use notifies::Notifies;
pub use pipeline::{FetchGroups, PipelineCommunicate, QueuedCommand};

use crate::error::Result;
use crate::transport::Transport;

/// Readiness a suspended machine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Read,
    Write,
    ReadWrite,
}

/// Readiness delivered to a resuming machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// No readiness; periodic tick or initial resumption.
    Timeout,
    Read,
    Write,
    ReadWrite,
}

impl Ready {
    pub fn readable(self) -> bool {
        matches!(self, Ready::Read | Ready::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Ready::Write | Ready::ReadWrite)
    }
}

/// Outcome of one resumption.
#[derive(Debug)]
pub enum Step<T> {
    /// Suspended; resume after the given readiness arrives.
    Pending(Wait),
    /// Finished with a value.
    Ready(T),
}

/// A resumable, non-blocking protocol operation over a transport-like
/// collaborator (a [`Transport`] or a [`crate::transport::CancelRequest`]).
pub trait Machine<C> {
    type Output;

    /// Advance as far as the transport allows.
    ///
    /// `ready` is `Timeout` on the first call and on periodic ticks; it
    /// reflects actual socket readiness otherwise. Machines must re-suspend
    /// cleanly on ticks without losing state.
    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<Self::Output>>;
}

/// Read pending input, then report whether a parsed result is available.
///
/// Shared fetch step: returns `true` once `get_result` can answer without
/// blocking.
pub(crate) fn absorb_input<C: Transport>(conn: &mut C) -> Result<bool> {
    if conn.is_busy() {
        conn.consume_input()?;
    }
    Ok(!conn.is_busy())
}

//! Waiters: scheduling policies that pump a [`Machine`] to completion.
//!
//! A waiter owns the sleep between resumptions and nothing else; the
//! protocol logic stays in the machines. The blocking waiter parks the
//! thread on the socket, the [`tokio`] waiter yields to the runtime.
//!
//! Both wake up every [`WAIT_INTERVAL`] regardless of readiness and resume
//! the machine with [`Ready::Timeout`], so machines can enforce deadlines
//! and the process stays responsive to shutdown.

#[cfg(feature = "tokio")]
pub mod tokio;

use std::time::Duration;

use crate::machine::{Machine, Ready, Step};
use crate::transport::Socketed;

/// Periodic tick delivered to suspended machines.
pub const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Pump a machine to completion, blocking the thread between resumptions.
///
/// The socket descriptor is re-read on every suspension because a
/// transport may switch sockets mid-operation.
#[cfg(feature = "sync")]
pub fn wait<C, M>(machine: &mut M, conn: &mut C) -> crate::error::Result<M::Output>
where
    C: Socketed,
    M: Machine<C>,
{
    let mut ready = Ready::Timeout;
    loop {
        match machine.resume(conn, ready)? {
            Step::Ready(output) => return Ok(output),
            Step::Pending(wants) => ready = blocking::poll_socket(conn.socket()?, wants)?,
        }
    }
}

#[cfg(feature = "sync")]
mod blocking {
    use std::os::fd::{BorrowedFd, RawFd};

    use polling::{Event, Events, Poller};

    use super::WAIT_INTERVAL;
    use crate::error::Result;
    use crate::machine::{Ready, Wait};

    /// Sleep on one socket until it reaches the wanted readiness or the
    /// tick interval elapses.
    pub(super) fn poll_socket(fd: RawFd, wants: Wait) -> Result<Ready> {
        let interest = match wants {
            Wait::Read => Event::readable(0),
            Wait::Write => Event::writable(0),
            Wait::ReadWrite => Event::all(0),
        };
        let poller = Poller::new()?;
        // SAFETY: the caller's transport keeps the descriptor open for the
        // whole call, and it is removed from the poller before returning.
        unsafe {
            poller.add(fd, interest)?;
        }
        let mut events = Events::new();
        let outcome = poller.wait(&mut events, Some(WAIT_INTERVAL));
        // SAFETY: same descriptor registered above, still open.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        poller.delete(borrowed)?;
        outcome?;

        let mut readable = false;
        let mut writable = false;
        for event in events.iter() {
            readable |= event.readable;
            writable |= event.writable;
        }
        Ok(match (readable, writable) {
            (true, true) => Ready::ReadWrite,
            (true, false) => Ready::Read,
            (false, true) => Ready::Write,
            (false, false) => Ready::Timeout,
        })
    }
}

#[cfg(all(test, feature = "sync"))]
mod tests {
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::error::Result;
    use crate::machine::{Ready, Step, Wait};

    /// Completes once the socket it is pointed at becomes readable.
    struct UntilReadable;

    impl<C: Socketed> crate::machine::Machine<C> for UntilReadable {
        type Output = ();

        fn resume(&mut self, _conn: &mut C, ready: Ready) -> Result<Step<()>> {
            if ready.readable() {
                Ok(Step::Ready(()))
            } else {
                Ok(Step::Pending(Wait::Read))
            }
        }
    }

    struct Sock(TcpStream);

    impl Socketed for Sock {
        fn socket(&self) -> Result<std::os::fd::RawFd> {
            Ok(self.0.as_raw_fd())
        }
    }

    #[test]
    fn blocking_waiter_wakes_on_readable_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            server.write_all(b"x").unwrap();
            server
        });

        let mut conn = Sock(client);
        wait(&mut UntilReadable, &mut conn).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn blocking_waiter_ticks_without_readiness() {
        // An idle socket yields Timeout ticks rather than hanging forever.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();

        struct CountTicks(u32);

        impl<C: Socketed> crate::machine::Machine<C> for CountTicks {
            type Output = u32;

            fn resume(&mut self, _conn: &mut C, ready: Ready) -> Result<Step<u32>> {
                if ready == Ready::Timeout {
                    self.0 += 1;
                }
                if self.0 >= 2 {
                    Ok(Step::Ready(self.0))
                } else {
                    Ok(Step::Pending(Wait::Read))
                }
            }
        }

        let mut conn = Sock(client);
        let ticks = wait(&mut CountTicks(0), &mut conn).unwrap();
        assert_eq!(ticks, 2);
    }
}

//! Cooperative waiter for the tokio runtime.
//!
//! Same contract as the blocking waiter: pump the machine, sleep on the
//! socket in between, tick every [`WAIT_INTERVAL`](super::WAIT_INTERVAL).
//! The descriptor is registered fresh for every suspension since the
//! transport may change sockets mid-operation.

use std::os::fd::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::WAIT_INTERVAL;
use crate::error::Result;
use crate::machine::{Machine, Ready, Step, Wait};
use crate::transport::Socketed;

/// Borrowed descriptor wrapper; does not close the socket on drop.
struct BorrowedSocket(RawFd);

impl AsRawFd for BorrowedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Pump a machine to completion, yielding to the runtime between
/// resumptions.
pub async fn wait<C, M>(machine: &mut M, conn: &mut C) -> Result<M::Output>
where
    C: Socketed,
    M: Machine<C>,
{
    let mut ready = Ready::Timeout;
    loop {
        match machine.resume(conn, ready)? {
            Step::Ready(output) => return Ok(output),
            Step::Pending(wants) => {
                let interest = match wants {
                    Wait::Read => Interest::READABLE,
                    Wait::Write => Interest::WRITABLE,
                    Wait::ReadWrite => Interest::READABLE | Interest::WRITABLE,
                };
                let socket = BorrowedSocket(conn.socket()?);
                let registered = AsyncFd::with_interest(socket, interest)?;
                ready = match tokio::time::timeout(WAIT_INTERVAL, registered.ready(interest)).await
                {
                    Err(_) => Ready::Timeout,
                    Ok(readiness) => {
                        let mut guard = readiness?;
                        let state = guard.ready();
                        guard.clear_ready();
                        match (state.is_readable(), state.is_writable()) {
                            (true, true) => Ready::ReadWrite,
                            (true, false) => Ready::Read,
                            (false, true) => Ready::Write,
                            (false, false) => Ready::Timeout,
                        }
                    }
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use super::*;

    struct Sock(TcpStream);

    impl Socketed for Sock {
        fn socket(&self) -> Result<RawFd> {
            Ok(self.0.as_raw_fd())
        }
    }

    struct UntilReadable;

    impl<C: Socketed> Machine<C> for UntilReadable {
        type Output = ();

        fn resume(&mut self, _conn: &mut C, ready: Ready) -> Result<Step<()>> {
            if ready.readable() {
                Ok(Step::Ready(()))
            } else {
                Ok(Step::Pending(Wait::Read))
            }
        }
    }

    #[tokio::test]
    async fn tokio_waiter_wakes_on_readable_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            server.write_all(b"x").unwrap();
            server
        });

        let mut conn = Sock(client);
        wait(&mut UntilReadable, &mut conn).await.unwrap();
        handle.join().unwrap();
    }
}

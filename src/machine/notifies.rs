use std::time::Instant;

use super::{Machine, Ready, Step, Wait};
use crate::error::Result;
use crate::transport::{Notify, Transport};

/// Waits for asynchronous notifications (LISTEN/NOTIFY).
///
/// Completes with at least one notification, or with an empty batch once
/// the optional deadline passes.
pub struct Notifies {
    deadline: Option<Instant>,
}

impl Notifies {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline }
    }
}

impl<C: Transport> Machine<C> for Notifies {
    type Output = Vec<Notify>;

    fn resume(&mut self, conn: &mut C, ready: Ready) -> Result<Step<Vec<Notify>>> {
        if ready.readable() {
            conn.consume_input()?;
        }
        let mut batch = Vec::new();
        while let Some(notify) = conn.take_notify() {
            batch.push(notify);
        }
        if !batch.is_empty() {
            return Ok(Step::Ready(batch));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Ok(Step::Ready(batch));
        }
        Ok(Step::Pending(Wait::Read))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::lab::LabTransport;

    fn notify(channel: &str, payload: &str) -> Notify {
        Notify {
            channel: channel.into(),
            payload: payload.into(),
            backend_pid: 7,
        }
    }

    #[test]
    fn returns_buffered_batch() {
        let (mut conn, control) = LabTransport::pair();
        control.push_notify(notify("jobs", "1"));
        control.push_notify(notify("jobs", "2"));
        let mut machine = Notifies::new(None);
        match machine.resume(&mut conn, Ready::Read).unwrap() {
            Step::Ready(batch) => assert_eq!(batch.len(), 2),
            Step::Pending(_) => panic!("expected a batch"),
        }
    }

    #[test]
    fn suspends_until_something_arrives() {
        let (mut conn, _control) = LabTransport::pair();
        let mut machine = Notifies::new(None);
        assert!(matches!(
            machine.resume(&mut conn, Ready::Timeout).unwrap(),
            Step::Pending(Wait::Read)
        ));
    }

    #[test]
    fn expired_deadline_yields_empty_batch() {
        let (mut conn, _control) = LabTransport::pair();
        let mut machine = Notifies::new(Some(Instant::now()));
        match machine.resume(&mut conn, Ready::Timeout).unwrap() {
            Step::Ready(batch) => assert!(batch.is_empty()),
            Step::Pending(_) => panic!("deadline should have fired"),
        }
    }
}

//! Pipeline bookkeeping: queued commands, result slots and tickets.
//!
//! While a connection is in pipeline mode, commands are queued instead of
//! sent and every queued command registers one [`ResultSlot`]. Harvested
//! result groups are matched to slots strictly in order, so the n-th group
//! always answers the n-th queued command. A caller that wants the results
//! of its command receives a ticket to redeem once the pipeline has been
//! drained past that command.

use std::collections::{BTreeMap, VecDeque};

use tracing::trace;

use crate::error::{Error, Result};
use crate::machine::QueuedCommand;
use crate::prepare::StatementKey;
use crate::transport::{ExecStatus, PqResult};

/// What to do with one command's result group when it arrives.
#[derive(Debug, Default)]
pub(crate) struct ResultSlot {
    /// Store the group under this ticket for later redemption.
    pub ticket: Option<usize>,
    /// Register this statement as prepared if the group is not an error.
    pub prepare: Option<(StatementKey, String)>,
}

/// Queued commands and their outstanding result slots.
#[derive(Debug, Default)]
pub(crate) struct PipelineState {
    commands: VecDeque<QueuedCommand>,
    slots: VecDeque<ResultSlot>,
    fetched: BTreeMap<usize, Vec<PqResult>>,
    next_ticket: usize,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command; with `wants_results` the caller gets a ticket to
    /// redeem its result group.
    pub fn enqueue(
        &mut self,
        command: QueuedCommand,
        prepare: Option<(StatementKey, String)>,
        wants_results: bool,
    ) -> Option<usize> {
        let ticket = wants_results.then(|| {
            let ticket = self.next_ticket;
            self.next_ticket += 1;
            ticket
        });
        self.commands.push_back(command);
        self.slots.push_back(ResultSlot { ticket, prepare });
        ticket
    }

    /// Queue a synchronization point. Its group is a single sync result.
    pub fn enqueue_sync(&mut self) {
        self.commands.push_back(QueuedCommand::Sync);
        self.slots.push_back(ResultSlot::default());
    }

    /// Hand the queued commands to a communicate machine.
    pub fn take_commands(&mut self) -> VecDeque<QueuedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Result groups still expected from the server.
    pub fn pending_slots(&self) -> usize {
        self.slots.len()
    }

    /// Match harvested groups to their slots, in order.
    ///
    /// Groups redeemed by a ticket are stored as-is, errors included; the
    /// ticket holder surfaces them. An error in a group nobody will redeem
    /// is raised here, and statements whose prepare group failed are
    /// reported so they are not registered as cached.
    pub fn absorb(
        &mut self,
        groups: Vec<Vec<PqResult>>,
    ) -> Result<Vec<(StatementKey, String)>> {
        let mut prepared = Vec::new();
        for group in groups {
            let Some(slot) = self.slots.pop_front() else {
                return Err(Error::Internal(format!(
                    "pipeline received an unexpected result group of {} results",
                    group.len()
                )));
            };
            let failed = group
                .iter()
                .find(|res| res.status == ExecStatus::FatalError);
            if let Some((key, name)) = slot.prepare
                && failed.is_none()
            {
                prepared.push((key, name));
            }
            match slot.ticket {
                Some(ticket) => {
                    trace!(ticket, results = group.len(), "pipeline group stored");
                    self.fetched.insert(ticket, group);
                }
                None => {
                    if let Some(failed) = failed {
                        return Err(failed.clone().into_error());
                    }
                }
            }
        }
        Ok(prepared)
    }

    /// Redeem a ticket issued by [`Self::enqueue`].
    pub fn take(&mut self, ticket: usize) -> Option<Vec<PqResult>> {
        self.fetched.remove(&ticket)
    }

    /// Whether the group for `ticket` has arrived.
    pub fn is_fetched(&self, ticket: usize) -> bool {
        self.fetched.contains_key(&ticket)
    }

    /// True when nothing is queued, expected or unredeemed.
    pub fn is_drained(&self) -> bool {
        self.commands.is_empty() && self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Format;

    fn query(sql: &str) -> QueuedCommand {
        QueuedCommand::QueryParams {
            sql: sql.into(),
            params: vec![],
            result_format: Format::Text,
        }
    }

    fn group(status: ExecStatus) -> Vec<PqResult> {
        vec![PqResult::with_status(status)]
    }

    #[test]
    fn tickets_redeem_groups_in_order() {
        let mut state = PipelineState::new();
        let t1 = state.enqueue(query("select 1"), None, true).unwrap();
        let t2 = state.enqueue(query("select 2"), None, true).unwrap();
        state.enqueue_sync();
        assert!(state.has_commands());
        assert_eq!(state.take_commands().len(), 3);
        assert!(!state.has_commands());
        assert_eq!(state.pending_slots(), 3);

        state
            .absorb(vec![
                group(ExecStatus::TuplesOk),
                group(ExecStatus::CommandOk),
                group(ExecStatus::PipelineSync),
            ])
            .unwrap();
        assert_eq!(state.take(t1).unwrap()[0].status, ExecStatus::TuplesOk);
        assert_eq!(state.take(t2).unwrap()[0].status, ExecStatus::CommandOk);
        assert!(state.is_drained());
    }

    #[test]
    fn partial_harvest_keeps_lock_step() {
        let mut state = PipelineState::new();
        let t1 = state.enqueue(query("select 1"), None, true).unwrap();
        let t2 = state.enqueue(query("select 2"), None, true).unwrap();
        state.absorb(vec![group(ExecStatus::TuplesOk)]).unwrap();
        assert!(state.is_fetched(t1));
        assert!(!state.is_fetched(t2));
        assert_eq!(state.pending_slots(), 1);
    }

    #[test]
    fn unexpected_group_is_an_internal_error() {
        let mut state = PipelineState::new();
        let err = state.absorb(vec![group(ExecStatus::CommandOk)]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn error_in_ticketed_group_is_deferred_to_the_holder() {
        let mut state = PipelineState::new();
        let ticket = state.enqueue(query("select broken"), None, true).unwrap();
        state.absorb(vec![group(ExecStatus::FatalError)]).unwrap();
        assert_eq!(
            state.take(ticket).unwrap()[0].status,
            ExecStatus::FatalError
        );
    }

    #[test]
    fn error_in_unclaimed_group_is_raised() {
        let mut state = PipelineState::new();
        state.enqueue(query("set x"), None, false);
        let err = state.absorb(vec![group(ExecStatus::FatalError)]).unwrap_err();
        assert!(matches!(err, Error::Operational(_) | Error::Server(_)));
    }

    #[test]
    fn failed_prepare_is_not_reported_as_cached() {
        let mut state = PipelineState::new();
        let key = StatementKey::new("select $1", vec![23]);
        state.enqueue(
            QueuedCommand::Prepare {
                name: "_pg_stmt_0".into(),
                sql: "select $1".into(),
                param_oids: vec![23],
            },
            Some((key.clone(), "_pg_stmt_0".into())),
            true,
        );
        state.enqueue(
            QueuedCommand::Prepare {
                name: "_pg_stmt_1".into(),
                sql: "select $2".into(),
                param_oids: vec![23],
            },
            Some((StatementKey::new("select $2", vec![23]), "_pg_stmt_1".into())),
            true,
        );
        let prepared = state
            .absorb(vec![group(ExecStatus::CommandOk), group(ExecStatus::FatalError)])
            .unwrap();
        assert_eq!(prepared, vec![(key, "_pg_stmt_0".into())]);
    }
}

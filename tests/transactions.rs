#![cfg(feature = "sync")]

use pump_postgres::transport::lab::{LabTransport, SentCommand};
use pump_postgres::transport::TransactionStatus;
use pump_postgres::{Connection, Error, ExecStatus, PqResult};

fn command_ok(tag: &str) -> PqResult {
    let mut result = PqResult::with_status(ExecStatus::CommandOk);
    result.command_tag = Some(tag.into());
    result
}

#[test]
fn failed_transaction_rolls_back_and_recovers() {
    let (transport, control) = LabTransport::pair();
    let mut conn = Connection::wrap(transport);

    control.script_results([command_ok("BEGIN")]);
    control.script_results([command_ok("INSERT 0 1")]);
    let mut failed = PqResult::with_status(ExecStatus::FatalError);
    failed.error = Some(pump_postgres::ServerError::new(
        "duplicate key value",
        "23505",
    ));
    control.script_results([failed]);
    control.script_results([command_ok("ROLLBACK")]);

    let result: Result<(), Error> = conn.transaction(|conn| {
        control.set_transaction_status(TransactionStatus::InTransaction);
        let mut cursor = conn.cursor();
        cursor.execute("INSERT INTO t VALUES (1)", &[])?;
        cursor.execute("INSERT INTO t VALUES (1)", &[])?;
        Ok(())
    });
    assert_eq!(
        result.err().and_then(|e| e.sqlstate().map(str::to_owned)),
        Some("23505".into())
    );
    assert_eq!(
        control.sent(),
        vec![
            SentCommand::Query("BEGIN".into()),
            SentCommand::Query("INSERT INTO t VALUES (1)".into()),
            SentCommand::Query("INSERT INTO t VALUES (1)".into()),
            SentCommand::Query("ROLLBACK".into()),
        ]
    );

    // The session stays usable after the rollback.
    control.set_transaction_status(TransactionStatus::Idle);
    control.clear_sent();
    control.script_results([command_ok("BEGIN")]);
    control.script_results([command_ok("INSERT 0 1")]);
    conn.cursor().execute("INSERT INTO t VALUES (2)", &[]).unwrap();
    control.set_transaction_status(TransactionStatus::InTransaction);
    control.script_results([command_ok("COMMIT")]);
    conn.commit().unwrap();
    assert_eq!(
        control.sent().last(),
        Some(&SentCommand::Query("COMMIT".into()))
    );
}

#[test]
fn close_is_idempotent_and_final() {
    let (transport, control) = LabTransport::pair();
    let mut conn = Connection::wrap(transport);
    assert!(!conn.is_closed());

    conn.close();
    assert!(conn.is_closed());
    assert!(control.finished());

    // A second close is a quiet no-op.
    conn.close();
    assert!(conn.is_closed());

    let err = conn.cursor().execute("SELECT 1", &[]).err().unwrap();
    assert!(matches!(err, Error::Operational(_)));
    assert!(conn.notifies(None).is_err());
}

#![cfg(feature = "sync")]

use std::sync::Arc;

use pump_postgres::transport::lab::{LabStep, LabTransport, SentCommand};
use pump_postgres::transport::{ColumnDescription, SharedColumns};
use pump_postgres::{Connection, ExecStatus, Format, PqResult};

fn int_column() -> SharedColumns {
    Arc::new(vec![ColumnDescription {
        name: "x".into(),
        type_oid: 23,
        type_modifier: -1,
        type_size: 4,
        format: Format::Text,
    }])
}

fn one_row(value: i32) -> PqResult {
    let mut result = PqResult::with_status(ExecStatus::TuplesOk);
    result.columns = int_column();
    result.rows = vec![vec![Some(value.to_string().into_bytes())]];
    result
}

#[test]
fn pipelined_commands_answer_in_submission_order() {
    let (transport, control) = LabTransport::pair();
    let mut conn = Connection::wrap(transport);
    conn.set_autocommit(true).unwrap();

    conn.pipeline(|conn| {
        let mut cursor = conn.cursor();
        for i in 1..=3 {
            cursor.execute(&format!("SELECT {i}"), &[])?;
            control.push(LabStep::Result(one_row(i)));
            control.push(LabStep::Done);
            let row = cursor.fetch_one()?.unwrap();
            assert_eq!(row.get::<i32>(0)?, i);
        }
        control.push(LabStep::Result(PqResult::with_status(
            ExecStatus::PipelineSync,
        )));
        Ok(())
    })
    .unwrap();

    let sent = control.sent();
    let queries: Vec<&str> = sent
        .iter()
        .filter_map(|cmd| match cmd {
            SentCommand::QueryParams { sql, .. } => Some(sql.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(queries, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    let syncs = sent
        .iter()
        .filter(|cmd| matches!(cmd, SentCommand::PipelineSync))
        .count();
    assert_eq!(syncs, 1);
    assert!(!control.in_pipeline_mode());
}

#[test]
fn pipeline_mode_is_left_even_after_errors() {
    let (transport, control) = LabTransport::pair();
    let mut conn = Connection::wrap(transport);
    conn.set_autocommit(true).unwrap();

    let result = conn.pipeline(|conn| {
        let mut cursor = conn.cursor();
        cursor.execute("SELEC 1", &[])?;
        let mut failed = PqResult::with_status(ExecStatus::FatalError);
        failed.error = Some(pump_postgres::ServerError::new("syntax error", "42601"));
        control.push(LabStep::Result(failed));
        control.push(LabStep::Done);
        control.push(LabStep::Result(PqResult::with_status(
            ExecStatus::PipelineSync,
        )));
        let fetched = cursor.fetch_one();
        assert!(fetched.is_err());
        fetched.map(drop)
    });
    let sqlstate = result.err().and_then(|e| e.sqlstate().map(str::to_owned));
    assert_eq!(sqlstate, Some("42601".into()));
    assert!(!control.in_pipeline_mode());
}

use pump_postgres::Conninfo;

fn value<'a>(attempt: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attempt
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[test]
fn hosts_are_attempted_in_listed_order() {
    let info = Conninfo::parse(
        "postgres://u@db1:5433,db2:5434/app?hostaddr=10.0.0.1,10.0.0.2",
    )
    .unwrap();
    let attempts = info.attempts(|_| None).unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(value(&attempts[0], "host"), Some("db1"));
    assert_eq!(value(&attempts[0], "hostaddr"), Some("10.0.0.1"));
    assert_eq!(value(&attempts[0], "port"), Some("5433"));
    assert_eq!(value(&attempts[1], "host"), Some("db2"));
    assert_eq!(value(&attempts[1], "hostaddr"), Some("10.0.0.2"));
    assert_eq!(value(&attempts[1], "port"), Some("5434"));
}

#[test]
fn single_port_broadcasts_over_all_hosts() {
    let info =
        Conninfo::parse("host=db1,db2,db3 hostaddr=10.0.0.1,10.0.0.2,10.0.0.3 port=6000")
            .unwrap();
    let attempts = info.attempts(|_| None).unwrap();
    assert_eq!(attempts.len(), 3);
    for attempt in &attempts {
        assert_eq!(value(attempt, "port"), Some("6000"));
    }
}

#[test]
fn mismatched_port_list_is_refused() {
    let info = Conninfo::parse("host=db1,db2 port=5433,5434,5435").unwrap();
    assert!(info.attempts(|_| None).is_err());
}

#[test]
fn environment_fills_missing_keys() {
    let info = Conninfo::parse("dbname=app hostaddr=10.0.0.9").unwrap();
    let attempts = info
        .attempts(|key| match key {
            "PGUSER" => Some("env_user".into()),
            "PGPORT" => Some("7000".into()),
            _ => None,
        })
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(value(&attempts[0], "user"), Some("env_user"));
    assert_eq!(value(&attempts[0], "port"), Some("7000"));
    assert_eq!(value(&attempts[0], "dbname"), Some("app"));
}

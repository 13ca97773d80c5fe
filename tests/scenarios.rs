//! Black-box replication scenarios driven entirely through the public
//! `Replica` API, each replica backed by its own on-disk SQLite file.

use sqlite_sync_core::codec::{decode_map, encode_map, encode_pk, id_to_hex, new_id, Value};
use sqlite_sync_core::log::{store, OperationType, SyncOperation};
use sqlite_sync_core::{ConflictPolicy, Hlc, Replica, ReplicaConfig, VectorClock};
use tempfile::{tempdir, TempDir};

fn open_replica(dir: &TempDir, file_name: &str, policy: ConflictPolicy) -> Replica {
    let path = dir.path().join(file_name);
    let config = ReplicaConfig {
        default_conflict_policy: policy,
        ..ReplicaConfig::default()
    };
    Replica::open(&path, config).unwrap()
}

fn create_table(replica: &Replica, ddl: &str, table_name: &str) {
    replica.with_connection(|conn| Ok(conn.execute_batch(ddl)?)).unwrap();
    replica.enable_sync_for_table(table_name).unwrap();
}

#[test]
fn basic_replication_then_idempotent_reimport() {
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, "a.db", ConflictPolicy::ColumnLevelLww);
    let b = open_replica(&dir, "b.db", ConflictPolicy::ColumnLevelLww);

    let ddl = "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)";
    create_table(&a, ddl, "items");
    create_table(&b, ddl, "items");

    a.with_connection(|conn| {
        conn.execute("INSERT INTO items (id, name) VALUES (1, 'Item 1')", [])?;
        conn.execute("INSERT INTO items (id, name) VALUES (2, 'Item 2')", [])?;
        Ok(())
    })
    .unwrap();

    let bundle_path = dir.path().join("a_to_b.bundle.db");
    a.generate_bundle(&b.device_id(), &bundle_path).unwrap().unwrap();

    let result = b.import_bundle(&bundle_path).unwrap();
    assert_eq!(result.applied_count, 2);
    assert_eq!(result.conflict_count, 0);

    let count: i64 = b
        .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(count, 2);

    // Re-importing the very same bundle is a no-op: same content hash, same
    // state on disk.
    let second = b.import_bundle(&bundle_path).unwrap();
    assert!(second.skipped);
    assert_eq!(second.applied_count, 0);

    let count_after: i64 = b
        .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(count_after, 2);
}

#[test]
fn bidirectional_sync_converges_both_directions() {
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, "a.db", ConflictPolicy::ColumnLevelLww);
    let b = open_replica(&dir, "b.db", ConflictPolicy::ColumnLevelLww);

    let ddl = "CREATE TABLE data (value TEXT PRIMARY KEY)";
    create_table(&a, ddl, "data");
    create_table(&b, ddl, "data");

    a.with_connection(|conn| Ok(conn.execute("INSERT INTO data (value) VALUES ('from_a')", [])?))
        .unwrap();
    let a_to_b = dir.path().join("a_to_b.bundle.db");
    a.generate_bundle(&b.device_id(), &a_to_b).unwrap().unwrap();
    let applied_on_b = b.import_bundle(&a_to_b).unwrap();
    assert_eq!(applied_on_b.applied_count, 1);

    b.with_connection(|conn| Ok(conn.execute("INSERT INTO data (value) VALUES ('from_b')", [])?))
        .unwrap();
    let b_to_a = dir.path().join("b_to_a.bundle.db");
    b.generate_bundle(&a.device_id(), &b_to_a).unwrap().unwrap();
    let applied_on_a = a.import_bundle(&b_to_a).unwrap();
    assert_eq!(applied_on_a.applied_count, 1);

    for replica in [&a, &b] {
        let values: Vec<String> = replica
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT value FROM data ORDER BY value")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(values, vec!["from_a".to_string(), "from_b".to_string()]);
    }
}

#[test]
fn concurrent_edits_are_recorded_as_a_conflict() {
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, "a.db", ConflictPolicy::ColumnLevelLww);
    let b = open_replica(&dir, "b.db", ConflictPolicy::Manual);

    let ddl = "CREATE TABLE doc (id INTEGER PRIMARY KEY, content TEXT)";
    create_table(&a, ddl, "doc");
    create_table(&b, ddl, "doc");

    a.with_connection(|conn| Ok(conn.execute("INSERT INTO doc (id, content) VALUES (1, 'original')", [])?))
        .unwrap();
    let seed = dir.path().join("seed.bundle.db");
    a.generate_bundle(&b.device_id(), &seed).unwrap().unwrap();
    b.import_bundle(&seed).unwrap();

    // Both sides edit the same row while offline from each other.
    a.with_connection(|conn| Ok(conn.execute("UPDATE doc SET content = 'from_a' WHERE id = 1", [])?))
        .unwrap();
    b.with_connection(|conn| Ok(conn.execute("UPDATE doc SET content = 'from_b' WHERE id = 1", [])?))
        .unwrap();

    let a_to_b = dir.path().join("a_to_b.bundle.db");
    a.generate_bundle(&b.device_id(), &a_to_b).unwrap().unwrap();
    let result = b.import_bundle(&a_to_b).unwrap();

    assert!(result.conflict_count >= 1);

    let unresolved = b.get_unresolved_conflicts().unwrap();
    let pk = encode_pk(&[Value::Int(1)]).unwrap();
    assert!(unresolved
        .iter()
        .any(|c| c.table_name == "doc" && c.row_pk == pk && c.resolved_at.is_none()));
}

#[test]
fn column_level_merge_combines_disjoint_edits() {
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, "a.db", ConflictPolicy::ColumnLevelLww);
    let b = open_replica(&dir, "b.db", ConflictPolicy::ColumnLevelLww);

    let ddl = "CREATE TABLE profile (id INTEGER PRIMARY KEY, name TEXT, age INTEGER, city TEXT)";
    create_table(&a, ddl, "profile");
    create_table(&b, ddl, "profile");

    a.with_connection(|conn| {
        Ok(conn.execute(
            "INSERT INTO profile (id, name, age, city) VALUES (1, 'Initial', 20, 'London')",
            [],
        )?)
    })
    .unwrap();
    let seed = dir.path().join("seed.bundle.db");
    a.generate_bundle(&b.device_id(), &seed).unwrap().unwrap();
    b.import_bundle(&seed).unwrap();

    // Concurrent edits to disjoint columns on the same row.
    a.with_connection(|conn| Ok(conn.execute("UPDATE profile SET name = 'Updated-By-A' WHERE id = 1", [])?))
        .unwrap();
    b.with_connection(|conn| Ok(conn.execute("UPDATE profile SET city = 'Paris' WHERE id = 1", [])?))
        .unwrap();

    let a_to_b = dir.path().join("a_to_b.bundle.db");
    a.generate_bundle(&b.device_id(), &a_to_b).unwrap().unwrap();
    let result = b.import_bundle(&a_to_b).unwrap();
    assert_eq!(result.conflict_count, 1);
    assert_eq!(result.applied_count, 1);
    assert!(b.get_unresolved_conflicts().unwrap().is_empty());

    let (name, age, city): (String, i64, String) = b
        .with_connection(|conn| {
            Ok(conn.query_row("SELECT name, age, city FROM profile WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?)
        })
        .unwrap();
    assert_eq!(name, "Updated-By-A");
    assert_eq!(age, 20);
    assert_eq!(city, "Paris");
}

#[test]
fn stale_operation_is_recorded_without_reverting_state() {
    let dir = tempdir().unwrap();
    let a = open_replica(&dir, "a.db", ConflictPolicy::ColumnLevelLww);
    let b = open_replica(&dir, "b.db", ConflictPolicy::ColumnLevelLww);

    let ddl = "CREATE TABLE counter (id INTEGER PRIMARY KEY, value TEXT)";
    create_table(&a, ddl, "counter");
    create_table(&b, ddl, "counter");

    a.with_connection(|conn| Ok(conn.execute("INSERT INTO counter (id, value) VALUES (1, 'v1')", [])?))
        .unwrap();
    a.with_connection(|conn| Ok(conn.execute("UPDATE counter SET value = 'v2' WHERE id = 1", [])?))
        .unwrap();
    a.with_connection(|conn| Ok(conn.execute("UPDATE counter SET value = 'v3' WHERE id = 1", [])?))
        .unwrap();

    let full = dir.path().join("full.bundle.db");
    a.generate_bundle(&b.device_id(), &full).unwrap().unwrap();
    let initial = b.import_bundle(&full).unwrap();
    assert_eq!(initial.applied_count, 3);

    let value: String = b
        .with_connection(|conn| Ok(conn.query_row("SELECT value FROM counter WHERE id = 1", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(value, "v3");

    let pk = encode_pk(&[Value::Int(1)]).unwrap();

    // Re-delivering the very same insert op (as a relay resending an old
    // message might) is a pure duplicate: rejected by op id, never
    // reapplied, and the log keeps exactly one row per op.
    let insert_op = a
        .get_new_operations(&VectorClock::new())
        .unwrap()
        .into_iter()
        .find(|op| op.op_type == OperationType::Insert)
        .unwrap();
    let resend = b.apply_batch(vec![insert_op], a.device_id()).unwrap();
    assert_eq!(resend.duplicate_count, 1);
    assert_eq!(resend.applied_count, 0);

    let ops_for_row = b.with_connection(|conn| store::ops_for_row(conn, "counter", &pk)).unwrap();
    assert_eq!(ops_for_row.len(), 3);
    let recorded_values: Vec<String> = ops_for_row
        .iter()
        .map(|op| {
            let values = decode_map(op.new_values.as_ref().unwrap()).unwrap();
            match values.get("value").unwrap() {
                Value::Text(s) => s.clone(),
                other => panic!("unexpected value: {other:?}"),
            }
        })
        .collect();
    assert_eq!(recorded_values, vec!["v1".to_string(), "v2".to_string(), "v3".to_string()]);

    // A brand-new operation whose vector clock is already dominated by what
    // this row has seen — a write relayed so late it arrives after its own
    // successors — is still appended and counted in applied_count, but
    // never touches the row.
    let mut stale_vc = VectorClock::new();
    stale_vc.set(&id_to_hex(&a.device_id()), 1);
    let stale_values = encode_map(
        &[(String::from("id"), Value::Int(1)), (String::from("value"), Value::Text("stale".to_string()))]
            .into_iter()
            .collect(),
    )
    .unwrap();
    let stale_op = SyncOperation::new(
        new_id(),
        a.device_id(),
        None,
        stale_vc.to_json().unwrap(),
        Hlc::new(1, 0, "relay").pack(),
        "counter".to_string(),
        OperationType::Update,
        pk.clone(),
        Some(stale_values.clone()),
        Some(stale_values),
        1,
        0,
        false,
        None,
    )
    .unwrap();

    let late = b.apply_batch(vec![stale_op], a.device_id()).unwrap();
    assert_eq!(late.applied_count, 1);
    assert_eq!(late.conflict_count, 0);

    let value_after: String = b
        .with_connection(|conn| Ok(conn.query_row("SELECT value FROM counter WHERE id = 1", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(value_after, "v3");
}

use crate::*;
use chrono::NaiveDate;

fn test_db() -> DB {
    Database::create(MemFile::new(), Version::V2010).unwrap()
}

fn dt(y: i32, mo: u32, d: u32, h: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

/// id int primary key, value text.
fn id_value_table(db: &DB, name: &str) -> TableHandle {
    let mut spec = TableSpec::new(name);
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.nullable = false;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("value", DataType::Text));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    db.create_table(&spec).unwrap()
}

fn insert_id_value(t: &TableHandle, id: i32, value: &str) -> Result<RowId> {
    let mut row = t.row();
    row[0] = Value::Int(id);
    row[1] = Value::text(value);
    t.insert_row(&mut row)
}

#[test]
fn row_insertion_and_index_scan() {
    let db = test_db();
    let t = id_value_table(&db, "S1");
    for (id, v) in [(3, "d3"), (7, "d7"), (6, "d6"), (1, "d1"), (2, "d2")] {
        insert_id_value(&t, id, v).unwrap();
    }
    let mut c = t.primary_cursor().unwrap();
    let mut fwd = Vec::new();
    while c.move_next(&db).unwrap() {
        fwd.push(c.current_row().unwrap()[0].as_int().unwrap());
    }
    assert_eq!(fwd, vec![1, 2, 3, 6, 7]);

    c.after_last();
    let mut back = Vec::new();
    while c.move_previous(&db).unwrap() {
        back.push(c.current_row().unwrap()[0].as_int().unwrap());
    }
    assert_eq!(back, vec![7, 6, 3, 2, 1]);
}

#[test]
fn unique_index_violation_changes_nothing() {
    let db = test_db();
    let t = id_value_table(&db, "S2");
    for (id, v) in [(3, "d3"), (7, "d7"), (6, "d6"), (1, "d1"), (2, "d2")] {
        insert_id_value(&t, id, v).unwrap();
    }
    let err = insert_id_value(&t, 3, "x").unwrap_err();
    assert!(matches!(err, Error::UniquenessViolation { .. }));
    assert_eq!(t.row_count(), 5);
    let pk = t.table.primary_data().unwrap();
    assert_eq!(pk.entry_count(&db.file).unwrap(), 5);
}

fn parent_child(db: &DB, flags: u32) -> (TableHandle, TableHandle) {
    let mut spec = TableSpec::new("P");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.nullable = false;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("name", DataType::Text));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let p = db.create_table(&spec).unwrap();

    let mut spec = TableSpec::new("C");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.nullable = false;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("pid", DataType::Long));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let c = db.create_table(&spec).unwrap();

    let mut rel = RelationshipSpec::new("CtoP", "C", "pid", "P", "id");
    rel.flags = flags;
    db.create_relationship(&rel).unwrap();
    // Creating the relationship rebuilt the child's index list.
    let _ = (p, c);
    (db.open_table("P").unwrap(), db.open_table("C").unwrap())
}

#[test]
fn cascade_delete() {
    let db = test_db();
    let (p, c) = parent_child(&db, REL_CASCADE_DELETES);
    for (id, n) in [(1, "a"), (2, "b")] {
        let mut row = p.row();
        row[0] = Value::Int(id);
        row[1] = Value::text(n);
        p.insert_row(&mut row).unwrap();
    }
    for (id, pid) in [(10, 1), (11, 1), (12, 2)] {
        let mut row = c.row();
        row[0] = Value::Int(id);
        row[1] = Value::Int(pid);
        c.insert_row(&mut row).unwrap();
    }

    // Find P's row 1 and delete it.
    let mut cur = p.primary_cursor().unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(1)]).unwrap());
    p.delete_row(cur.current_rowid().unwrap()).unwrap();

    assert_eq!(p.row_count(), 1);
    assert_eq!(c.row_count(), 1);
    let mut cur = c.cursor();
    assert!(cur.move_next(&db).unwrap());
    assert_eq!(cur.current_row().unwrap()[0].as_int(), Some(12));
    assert_eq!(cur.current_row().unwrap()[1].as_int(), Some(2));
    assert!(!cur.move_next(&db).unwrap());
}

#[test]
fn referential_integrity_checks() {
    let db = test_db();
    let (p, c) = parent_child(&db, 0);
    let mut row = p.row();
    row[0] = Value::Int(1);
    row[1] = Value::text("a");
    p.insert_row(&mut row).unwrap();

    // A child pointing at a missing parent is rejected.
    let mut row = c.row();
    row[0] = Value::Int(10);
    row[1] = Value::Int(99);
    assert!(matches!(
        c.insert_row(&mut row).unwrap_err(),
        Error::ReferentialIntegrityViolation { .. }
    ));

    // A null foreign key is allowed.
    let mut row = c.row();
    row[0] = Value::Int(10);
    row[1] = Value::Null;
    c.insert_row(&mut row).unwrap();

    // With no cascade action, a parent delete with live children restricts.
    let mut row = c.row();
    row[0] = Value::Int(11);
    row[1] = Value::Int(1);
    c.insert_row(&mut row).unwrap();
    let mut cur = p.primary_cursor().unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(1)]).unwrap());
    assert!(matches!(
        p.delete_row(cur.current_rowid().unwrap()).unwrap_err(),
        Error::ReferentialIntegrityViolation { .. }
    ));
    assert_eq!(p.row_count(), 1);
    assert_eq!(c.row_count(), 2);
}

#[test]
fn cascade_null_on_delete() {
    let db = test_db();
    let (p, c) = parent_child(&db, REL_CASCADE_NULL);
    let mut row = p.row();
    row[0] = Value::Int(1);
    row[1] = Value::text("a");
    p.insert_row(&mut row).unwrap();
    let mut row = c.row();
    row[0] = Value::Int(10);
    row[1] = Value::Int(1);
    let child_rowid = c.insert_row(&mut row).unwrap();

    let mut cur = p.primary_cursor().unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(1)]).unwrap());
    p.delete_row(cur.current_rowid().unwrap()).unwrap();

    let row = c.get_row(child_rowid).unwrap().unwrap();
    assert!(row[1].is_null());
    assert_eq!(c.row_count(), 1);
}

#[test]
fn cascade_update_propagates_key() {
    let db = test_db();
    let (p, c) = parent_child(&db, REL_CASCADE_UPDATES);
    let mut row = p.row();
    row[0] = Value::Int(1);
    row[1] = Value::text("a");
    let prow = p.insert_row(&mut row).unwrap();
    for id in [10, 11] {
        let mut row = c.row();
        row[0] = Value::Int(id);
        row[1] = Value::Int(1);
        c.insert_row(&mut row).unwrap();
    }
    let mut row = p.get_row(prow).unwrap().unwrap();
    row[0] = Value::Int(5);
    p.update_row(prow, &mut row).unwrap();

    let mut cur = c.cursor();
    while cur.move_next(&db).unwrap() {
        assert_eq!(cur.current_row().unwrap()[1].as_int(), Some(5));
    }
}

#[test]
fn cascade_cycle_detected_and_rolled_back() {
    let db = test_db();
    // P and C each reference the other with cascading deletes.
    let mut spec = TableSpec::new("P");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.nullable = false;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("cid", DataType::Long));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let p = db.create_table(&spec).unwrap();
    let mut spec = TableSpec::new("C");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.nullable = false;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("pid", DataType::Long));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let c = db.create_table(&spec).unwrap();

    let mut row = p.row();
    row[0] = Value::Int(1);
    p.insert_row(&mut row).unwrap();
    let mut row = p.row();
    row[0] = Value::Int(2);
    p.insert_row(&mut row).unwrap();
    let mut row = c.row();
    row[0] = Value::Int(10);
    c.insert_row(&mut row).unwrap();
    let mut row = c.row();
    row[0] = Value::Int(20);
    c.insert_row(&mut row).unwrap();

    let mut rel = RelationshipSpec::new("CtoP", "C", "pid", "P", "id");
    rel.flags = REL_CASCADE_DELETES;
    db.create_relationship(&rel).unwrap();
    let mut rel = RelationshipSpec::new("PtoC", "P", "cid", "C", "id");
    rel.flags = REL_CASCADE_DELETES;
    db.create_relationship(&rel).unwrap();

    // Wire the cycle: P1 <- C10 <- P2 <- C20 ( and C20 references P2 ).
    let p = db.open_table("P").unwrap();
    let c = db.open_table("C").unwrap();
    let mut cur = c.primary_cursor().unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(10)]).unwrap());
    let mut row = cur.current_row().unwrap().to_vec();
    row[1] = Value::Int(1);
    c.update_row(cur.current_rowid().unwrap(), &mut row).unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(20)]).unwrap());
    let mut row = cur.current_row().unwrap().to_vec();
    row[1] = Value::Int(2);
    c.update_row(cur.current_rowid().unwrap(), &mut row).unwrap();
    let mut cur = p.primary_cursor().unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(2)]).unwrap());
    let mut row = cur.current_row().unwrap().to_vec();
    row[1] = Value::Int(10);
    p.update_row(cur.current_rowid().unwrap(), &mut row).unwrap();

    // Deleting P1 cascades C10 -> P2 -> C20, re-entering CtoP: a cycle.
    let mut cur = p.primary_cursor().unwrap();
    assert!(cur.find_first_row_by_entry(&db, &[Value::Int(1)]).unwrap());
    let rowid = cur.current_rowid().unwrap();
    let err = p.delete_row(rowid).unwrap_err();
    assert!(matches!(err, Error::CascadeCycle(_)));

    // The barrier rolled back: every row survives.
    let p = db.open_table("P").unwrap();
    let c = db.open_table("C").unwrap();
    assert_eq!(p.row_count(), 2);
    assert_eq!(c.row_count(), 2);
}

#[test]
fn attachment_round_trip_through_table() {
    let db = test_db();
    let mut spec = TableSpec::new("Docs");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.auto_number = true;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("Files", DataType::Complex));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    db.create_table(&spec).unwrap();
    db.add_complex_column("Docs", "Files", ComplexKind::Attachment, DataType::Long)
        .unwrap();
    let t = db.open_table("Docs").unwrap();

    let mut row = t.row();
    let rowid = t.insert_row(&mut row).unwrap();
    let payload = b"this is some test data for attachment.".to_vec();
    t.add_attachment(
        rowid,
        "Files",
        &Attachment {
            file_url: None,
            file_name: "test_data.txt".to_string(),
            file_type: Some("txt".to_string()),
            file_data: payload.clone(),
            timestamp: Some(dt(2021, 4, 1, 12)),
            flags: 0,
        },
    )
    .unwrap();

    let atts = t.get_attachments(rowid, "Files").unwrap();
    assert_eq!(atts.len(), 1);
    assert_eq!(atts[0].file_name, "test_data.txt");
    assert_eq!(atts[0].file_type.as_deref(), Some("txt"));
    assert_eq!(atts[0].file_data, payload);

    // The stored blob starts with the DEFLATE flag.
    let flat_name = format!("f_{}_Files", t.table.id);
    let flat = db.open_table(&flat_name).unwrap();
    let mut cur = flat.cursor();
    assert!(cur.move_next(&db).unwrap());
    let blob = cur.current_row().unwrap()[5].as_bytes().unwrap().to_vec();
    assert_eq!(&blob[0..4], &[0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn version_history_ordering_and_immutability() {
    let db = test_db();
    let mut spec = TableSpec::new("Notes");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.auto_number = true;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("Body", DataType::Complex));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    db.create_table(&spec).unwrap();
    db.add_complex_column("Notes", "Body", ComplexKind::VersionHistory, DataType::Long)
        .unwrap();
    let t = db.open_table("Notes").unwrap();
    let mut row = t.row();
    let rowid = t.insert_row(&mut row).unwrap();

    // Arbitrary modification-date order.
    t.add_version(rowid, "Body", "v2", dt(2021, 2, 1, 0)).unwrap();
    t.add_version(rowid, "Body", "v4", dt(2021, 4, 1, 0)).unwrap();
    t.add_version(rowid, "Body", "v1", dt(2021, 1, 1, 0)).unwrap();
    t.add_version(rowid, "Body", "v3", dt(2021, 3, 1, 0)).unwrap();

    let versions = t.get_versions(rowid, "Body").unwrap();
    let got: Vec<&str> = versions.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(got, vec!["v4", "v3", "v2", "v1"]);

    assert!(matches!(
        complex::update_version(&db, &t.table, rowid, "Body", &versions[0]),
        Err(Error::VersionImmutable)
    ));
    assert!(matches!(
        complex::delete_version(&db, &t.table, rowid, "Body", &versions[0]),
        Err(Error::VersionImmutable)
    ));
}

#[test]
fn multi_value_column() {
    let db = test_db();
    let mut spec = TableSpec::new("Tags");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.auto_number = true;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("Tag", DataType::Complex));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    db.create_table(&spec).unwrap();
    db.add_complex_column("Tags", "Tag", ComplexKind::MultiValue, DataType::Text)
        .unwrap();
    let t = db.open_table("Tags").unwrap();
    let mut row = t.row();
    let rowid = t.insert_row(&mut row).unwrap();

    for tag in ["red", "green", "blue"] {
        t.add_multi_value(rowid, "Tag", Value::text(tag)).unwrap();
    }
    let vals = t.get_multi_values(rowid, "Tag").unwrap();
    assert_eq!(vals.len(), 3);
    assert!(vals.contains(&Value::text("green")));

    assert!(complex::delete_multi_value(&db, &t.table, rowid, "Tag", &Value::text("green")).unwrap());
    assert_eq!(t.get_multi_values(rowid, "Tag").unwrap().len(), 2);
}

#[test]
fn partial_key_lookup() {
    let db = test_db();
    let mut spec = TableSpec::new("S6");
    spec.columns.push(ColumnSpec::new("data1", DataType::Text));
    spec.columns.push(ColumnSpec::new("num2", DataType::Long));
    spec.columns.push(ColumnSpec::new("key3", DataType::Text));
    spec.indexes.push(IndexSpec {
        name: "ByAll".to_string(),
        cols: vec![
            ("data1".to_string(), false),
            ("num2".to_string(), true),
            ("key3".to_string(), false),
        ],
        unique: false,
        primary: false,
        ignore_nulls: false,
    });
    let t = db.create_table(&spec).unwrap();

    for d1 in ["A", "B", "C"] {
        for n in 0..5 {
            for k in ["K1", "K2"] {
                let mut row = t.row();
                row[0] = Value::text(d1);
                row[1] = Value::Int(n);
                row[2] = Value::text(k);
                t.insert_row(&mut row).unwrap();
            }
        }
    }

    let mut cur = t.index_cursor("ByAll").unwrap();
    // num2 is descending: the first row for "C" has the highest num2.
    assert!(cur.find_first_row_by_entry(&db, &[Value::text("C")]).unwrap());
    let row = cur.current_row().unwrap();
    assert_eq!(row[0].as_str(), Some("C"));
    assert_eq!(row[1].as_int(), Some(4));
    assert_eq!(row[2].as_str(), Some("K1"));

    assert!(cur
        .find_first_row_by_entry(&db, &[Value::text("C"), Value::Int(3)])
        .unwrap());
    let row = cur.current_row().unwrap();
    assert_eq!(row[1].as_int(), Some(3));
    assert_eq!(row[2].as_str(), Some("K1"));

    assert!(cur
        .find_first_row_by_entry(&db, &[Value::text("C"), Value::Int(4), Value::text("K1")])
        .unwrap());
    let only = cur.current_rowid().unwrap();
    let rows = cur
        .entry_rows(&db, &[Value::text("C"), Value::Int(4), Value::text("K1")])
        .unwrap();
    assert_eq!(rows, vec![only]);

    // Ten rows under the single-component prefix.
    assert_eq!(cur.entry_rows(&db, &[Value::text("C")]).unwrap().len(), 10);

    // More components than the index has columns.
    let err = cur
        .find_first_row_by_entry(
            &db,
            &[
                Value::text("C"),
                Value::Int(4),
                Value::text("K1"),
                Value::Int(9),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn add_then_delete_restores_counts() {
    let db = test_db();
    let t = id_value_table(&db, "T");
    for i in 0..10 {
        insert_id_value(&t, i, "x").unwrap();
    }
    let pk = t.table.primary_data().unwrap();
    let rows_before = t.row_count();
    let entries_before = pk.entry_count(&db.file).unwrap();

    let rid = insert_id_value(&t, 100, "y").unwrap();
    assert_eq!(t.row_count(), rows_before + 1);
    t.delete_row(rid).unwrap();

    assert_eq!(t.row_count(), rows_before);
    assert_eq!(pk.entry_count(&db.file).unwrap(), entries_before);
}

#[test]
fn auto_number_monotonic_and_not_consumed_on_failure() {
    let db = test_db();
    let mut spec = TableSpec::new("A");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.auto_number = true;
    spec.columns.push(id);
    let mut x = ColumnSpec::new("x", DataType::Long);
    x.nullable = false;
    spec.columns.push(x);
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let mut ux = IndexSpec::new("ByX", &["x"]);
    ux.unique = true;
    spec.indexes.push(ux);
    let t = db.create_table(&spec).unwrap();

    let mut row = t.row();
    row[1] = Value::Int(1);
    t.insert_row(&mut row).unwrap();
    let first = row[0].as_int().unwrap();

    // Duplicate x: the insert fails and no auto-number value is consumed.
    let mut row = t.row();
    row[1] = Value::Int(1);
    assert!(t.insert_row(&mut row).is_err());

    let mut row = t.row();
    row[1] = Value::Int(2);
    t.insert_row(&mut row).unwrap();
    let second = row[0].as_int().unwrap();
    assert_eq!(second, first + 1);
}

#[test]
fn cursor_savepoint_round_trip() {
    let db = test_db();
    let t = id_value_table(&db, "T");
    for i in 0..6 {
        insert_id_value(&t, i, "x").unwrap();
    }
    let mut c = t.primary_cursor().unwrap();
    c.move_next(&db).unwrap();
    c.move_next(&db).unwrap(); // on id 1
    let sp = c.savepoint();
    let at = c.current_rowid().unwrap();
    c.move_next(&db).unwrap();
    c.restore(&db, &sp).unwrap();
    assert_eq!(c.current_rowid(), Some(at));

    // Deleting the saved row: restore lands on the next survivor.
    t.delete_row(at).unwrap();
    c.restore(&db, &sp).unwrap();
    assert_eq!(c.current_row().unwrap()[0].as_int(), Some(2));

    // A savepoint does not restore onto a cursor of another table.
    let other = id_value_table(&db, "U");
    insert_id_value(&other, 1, "x").unwrap();
    let mut oc = other.primary_cursor().unwrap();
    assert!(matches!(
        oc.restore(&db, &sp),
        Err(Error::SavepointMismatch)
    ));
}

#[test]
fn deleted_row_substate() {
    let db = test_db();
    let t = id_value_table(&db, "T");
    for i in 0..3 {
        insert_id_value(&t, i, "x").unwrap();
    }
    let mut c = t.primary_cursor().unwrap();
    c.move_next(&db).unwrap();
    c.move_next(&db).unwrap(); // id 1
    let rowid = c.current_rowid().unwrap();
    assert!(!c.is_current_row_deleted(&db).unwrap());

    t.delete_row(rowid).unwrap();
    // The snapshot is still served; the live state reports the tombstone.
    assert_eq!(c.current_row().unwrap()[0].as_int(), Some(1));
    assert!(c.is_current_row_deleted(&db).unwrap());
    // Progress continues from the deletion point.
    assert!(c.move_next(&db).unwrap());
    assert_eq!(c.current_row().unwrap()[0].as_int(), Some(2));
}

#[test]
fn match_pattern_iteration() {
    let db = test_db();
    let t = id_value_table(&db, "T");
    for (i, v) in [(1, "Apple"), (2, "banana"), (3, "apple"), (4, "cherry")] {
        insert_id_value(&t, i, v).unwrap();
    }
    let mut c = t.cursor();
    let pattern = vec![("value".to_string(), Value::text("apple"))];
    assert!(c.find_first_row(&db, &pattern, &SimpleColumnMatcher).unwrap());
    assert_eq!(c.current_row().unwrap()[0].as_int(), Some(3));

    let mut c = t.cursor();
    let mut ids = Vec::new();
    c.before_first();
    while c
        .move_next_matching(&db, &pattern, &CaseInsensitiveColumnMatcher)
        .unwrap()
    {
        ids.push(c.current_row().unwrap()[0].as_int().unwrap());
    }
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn update_in_place_and_move() {
    let db = test_db();
    let t = id_value_table(&db, "T");
    let rid = insert_id_value(&t, 1, "short").unwrap();

    // Same-size update stays in place.
    let mut row = t.get_row(rid).unwrap().unwrap();
    row[1] = Value::text("shirt");
    let rid2 = t.update_row(rid, &mut row).unwrap();
    assert_eq!(rid, rid2);
    assert_eq!(
        t.get_row(rid2).unwrap().unwrap()[1].as_str(),
        Some("shirt")
    );

    // Index entries follow the updated key.
    let mut row = t.get_row(rid2).unwrap().unwrap();
    row[0] = Value::Int(42);
    let rid3 = t.update_row(rid2, &mut row).unwrap();
    let mut c = t.primary_cursor().unwrap();
    assert!(c.find_first_row_by_entry(&db, &[Value::Int(42)]).unwrap());
    assert_eq!(c.current_rowid(), Some(rid3));
    assert!(!c.find_first_row_by_entry(&db, &[Value::Int(1)]).unwrap());
}

#[test]
fn long_values_spill_and_follow_chains() {
    let db = test_db();
    let mut spec = TableSpec::new("M");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.auto_number = true;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("body", DataType::Memo));
    spec.columns.push(ColumnSpec::new("blob", DataType::Ole));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let t = db.create_table(&spec).unwrap();

    // Inline, single page and chained forms.
    let small = "tiny".to_string();
    let medium = "m".repeat(2000);
    let large = "Z".repeat(20_000);
    let blob: Vec<u8> = (0..30_000u32).map(|x| (x % 251) as u8).collect();

    let mut rids = Vec::new();
    for text in [&small, &medium, &large] {
        let mut row = t.row();
        row[1] = Value::text(text);
        row[2] = Value::Binary(Rc::new(blob.clone()));
        rids.push(t.insert_row(&mut row).unwrap());
    }
    for (rid, want) in rids.iter().zip([&small, &medium, &large]) {
        let row = t.get_row(*rid).unwrap().unwrap();
        assert_eq!(row[1].as_str(), Some(want.as_str()));
        assert_eq!(row[2].as_bytes(), Some(blob.as_slice()));
    }

    // Deleting a row releases its long values for reuse.
    t.delete_row(rids[2]).unwrap();
    assert_eq!(t.row_count(), 2);
}

#[test]
fn typed_columns_round_trip() {
    let db = test_db();
    let mut spec = TableSpec::new("AllTypes");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.auto_number = true;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("b", DataType::Boolean));
    spec.columns.push(ColumnSpec::new("y", DataType::Byte));
    spec.columns.push(ColumnSpec::new("s", DataType::Short));
    spec.columns.push(ColumnSpec::new("big", DataType::BigInt));
    spec.columns.push(ColumnSpec::new("f", DataType::Float));
    spec.columns.push(ColumnSpec::new("d", DataType::Double));
    spec.columns.push(ColumnSpec::new("m", DataType::Money));
    let mut n = ColumnSpec::new("n", DataType::Numeric);
    n.precision = 18;
    n.scale = 4;
    spec.columns.push(n);
    spec.columns.push(ColumnSpec::new("when", DataType::ShortDateTime));
    spec.columns.push(ColumnSpec::new("g", DataType::Guid));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let t = db.create_table(&spec).unwrap();

    let g = uuid::Uuid::new_v4();
    let mut row = t.row();
    row[1] = Value::Bool(true);
    row[2] = Value::Byte(7);
    row[3] = Value::Short(-300);
    row[4] = Value::BigInt(1 << 40);
    row[5] = Value::Float(2.5);
    row[6] = Value::Double(-0.125);
    row[7] = Value::Money(1_234_5678);
    row[8] = Value::Numeric(Decimal::new(true, 98765, 4));
    row[9] = Value::DateTime(dt(1999, 12, 31, 23));
    row[10] = Value::Guid(g);
    let rid = t.insert_row(&mut row).unwrap();

    let got = t.get_row(rid).unwrap().unwrap();
    assert_eq!(got[1], Value::Bool(true));
    assert_eq!(got[2], Value::Byte(7));
    assert_eq!(got[3], Value::Short(-300));
    assert_eq!(got[4], Value::BigInt(1 << 40));
    assert_eq!(got[5], Value::Float(2.5));
    assert_eq!(got[6], Value::Double(-0.125));
    assert_eq!(got[7], Value::Money(1_234_5678));
    assert_eq!(got[8], Value::Numeric(Decimal::new(true, 98765, 4)));
    assert_eq!(got[9], Value::DateTime(dt(1999, 12, 31, 23)));
    assert_eq!(got[10], Value::Guid(g));
}

#[test]
fn persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.jdb");
    let path = path.to_str().unwrap();
    {
        let db = Database::create(
            Box::new(SimpleFileStorage::new(path).unwrap()),
            Version::V2010,
        )
        .unwrap();
        let t = id_value_table(&db, "T");
        for i in 0..50 {
            insert_id_value(&t, i, &format!("row{}", i)).unwrap();
        }
    }
    let db = Database::open(Box::new(SimpleFileStorage::new(path).unwrap())).unwrap();
    assert_eq!(db.table_names().unwrap(), vec!["T".to_string()]);
    let t = db.open_table("t").unwrap();
    assert_eq!(t.row_count(), 50);
    let mut c = t.primary_cursor().unwrap();
    assert!(c.find_first_row_by_entry(&db, &[Value::Int(37)]).unwrap());
    assert_eq!(c.current_row().unwrap()[1].as_str(), Some("row37"));
}

#[test]
fn linked_tables_resolve_and_odbc_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let foreign_path = dir.path().join("other.jdb");
    let foreign_path = foreign_path.to_str().unwrap().to_string();
    {
        let db = Database::create(
            Box::new(SimpleFileStorage::new(&foreign_path).unwrap()),
            Version::V2010,
        )
        .unwrap();
        let t = id_value_table(&db, "Remote");
        insert_id_value(&t, 1, "remote row").unwrap();
    }

    let db = test_db();
    db.set_link_resolver(Box::new(FileLinkResolver));
    db.create_linked_table("LocalName", &foreign_path, "Remote")
        .unwrap();
    let t = db.open_table("LocalName").unwrap();
    assert_eq!(t.row_count(), 1);
    let mut c = t.cursor();
    assert!(c.move_next(&t.db).unwrap());
    assert_eq!(c.current_row().unwrap()[1].as_str(), Some("remote row"));

    // ODBC links expose schema but refuse data operations.
    let mut spec = TableSpec::new("OdbcShape");
    spec.columns.push(ColumnSpec::new("id", DataType::Long));
    db.create_odbc_table("Ext", "DSN=warehouse", "dbo.ext", &spec)
        .unwrap();
    let t = db.open_table("Ext").unwrap();
    assert_eq!(t.table.info.cols.len(), 1);
    let mut row = t.row();
    row[0] = Value::Int(1);
    assert!(matches!(
        t.insert_row(&mut row).unwrap_err(),
        Error::LinkedTableReadOnly(_)
    ));
}

#[test]
fn property_maps_persist_through_row_updates() {
    let db = test_db();
    id_value_table(&db, "T");

    let mut m = PropertyMap::new();
    m.put("Description", PropertyValue::Text("numbers".to_string()));
    db.set_table_props("T", m.clone()).unwrap();
    assert_eq!(db.table_props("T").unwrap(), m);

    let mut cm = PropertyMap::new();
    cm.put("Caption", PropertyValue::Text("Identifier".to_string()));
    db.set_column_props("T", "id", cm.clone()).unwrap();
    assert_eq!(db.column_props("T", "id").unwrap(), cm);
    // Table props are untouched by column updates.
    assert_eq!(db.table_props("T").unwrap(), m);

    let mut dm = PropertyMap::new();
    dm.put("AppVersion", PropertyValue::Int(3));
    db.set_database_props(dm.clone()).unwrap();
    assert_eq!(db.database_props().unwrap(), dm);
}

#[test]
fn explicit_write_barrier_groups_operations() {
    let db = test_db();
    let t = id_value_table(&db, "T");
    db.start_write().unwrap();
    for i in 0..10 {
        insert_id_value(&t, i, "x").unwrap();
    }
    db.finish_write().unwrap();
    assert_eq!(t.row_count(), 10);
}

#[test]
fn evaluator_hooks_fire() {
    struct Defaulter;
    impl ExprEvaluator for Defaulter {
        fn evaluate_default(
            &self,
            _db: &DB,
            _table: &Table,
            _column: &Column,
            _row: &[Value],
        ) -> Result<Value> {
            Ok(Value::text("defaulted"))
        }
        fn evaluate_calculated(
            &self,
            _db: &DB,
            _table: &Table,
            _column: &Column,
            _row: &[Value],
        ) -> Result<Value> {
            Ok(Value::Null)
        }
        fn validate_column(
            &self,
            _db: &DB,
            _table: &Table,
            column: &Column,
            row: &[Value],
        ) -> Result<()> {
            if row[column.ordinal].as_int() == Some(13) {
                return Err(Error::ConstraintViolation {
                    column: column.name.clone(),
                    reason: "thirteen is not allowed".to_string(),
                });
            }
            Ok(())
        }
        fn validate_row(&self, _db: &DB, _table: &Table, _row: &[Value]) -> Result<()> {
            Ok(())
        }
    }

    let db = test_db();
    let mut spec = TableSpec::new("T");
    let mut id = ColumnSpec::new("id", DataType::Long);
    id.nullable = false;
    spec.columns.push(id);
    spec.columns.push(ColumnSpec::new("v", DataType::Text));
    spec.indexes.push(IndexSpec::primary("PrimaryKey", &["id"]));
    let t = db.create_table(&spec).unwrap();
    db.set_evaluator(Rc::new(Defaulter));

    // Wire the hook metadata onto the loaded table's columns.
    {
        let table = &t.table;
        let mut info = table.info.clone();
        info.cols[1].default_expr = Some("=\"defaulted\"".to_string());
        info.cols[0].validation = Some("<>13".to_string());
        let patched = Rc::new(Table {
            id: table.id,
            name: table.name.clone(),
            def_page: table.def_page,
            info,
            index_data: table.index_data.clone(),
            logical: table.logical.clone(),
            data_map: UsageMap::load(&db.file, table.data_map.owner(), AllocMode::Normal).unwrap(),
            free_map: UsageMap::load(&db.file, table.free_map.owner(), AllocMode::Normal).unwrap(),
            lval_map: UsageMap::load(&db.file, table.lval_map.owner(), AllocMode::Normal).unwrap(),
            row_count: Cell::new(table.row_count.get()),
            next_auto: Cell::new(table.next_auto.get()),
            system: table.system,
            read_only: Cell::new(false),
        });
        db.start_write().unwrap();
        patched.save_def(&db.file).unwrap();
        db.finish_write().unwrap();
        db.tables.borrow_mut().clear();
    }
    let t = db.open_table("T").unwrap();

    let mut row = t.row();
    row[0] = Value::Int(1);
    let rid = t.insert_row(&mut row).unwrap();
    assert_eq!(
        t.get_row(rid).unwrap().unwrap()[1].as_str(),
        Some("defaulted")
    );

    let mut row = t.row();
    row[0] = Value::Int(13);
    assert!(matches!(
        t.insert_row(&mut row).unwrap_err(),
        Error::ConstraintViolation { .. }
    ));
}

#[test]
fn bulk_insert_scan_random_order() {
    use rand::seq::SliceRandom;
    let db = test_db();
    let t = id_value_table(&db, "Bulk");
    let mut ids: Vec<i32> = (0..1000).collect();
    ids.shuffle(&mut rand::thread_rng());
    for i in &ids {
        insert_id_value(&t, *i, &format!("r{}", i)).unwrap();
    }
    let mut c = t.primary_cursor().unwrap();
    let mut prev = -1i64;
    let mut n = 0;
    while c.move_next(&db).unwrap() {
        let id = c.current_row().unwrap()[0].as_int().unwrap();
        assert!(id > prev);
        prev = id;
        n += 1;
    }
    assert_eq!(n, 1000);
}

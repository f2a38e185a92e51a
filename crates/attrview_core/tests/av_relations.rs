use attrview_core::db::open_db_in_memory;
use attrview_core::model::id::parse_compact_time;
use attrview_core::model::{CalcOperator, RelationConfig};
use attrview_core::{
    Action, ApplyReport, AttributeViewService, AvStore, BlockKind, BlockNode, EngineConfig,
    InvalidationEvent, InvalidationReason, KeyType, Operation, RecordingEventSink, RenderRequest,
    RowSource, SqliteAvStore, SqliteDocumentTree, ValuePayload,
};
use attrview_core::repo::document::DocumentTree;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::sync::Arc;

type Service<'c> = AttributeViewService<SqliteAvStore<'c>, SqliteDocumentTree<'c>>;

fn service(conn: &Connection) -> Service<'_> {
    AttributeViewService::new(
        SqliteAvStore::new(conn),
        SqliteDocumentTree::new(conn),
        EngineConfig::default(),
    )
}

fn add_block(conn: &Connection, id: &str, content: &str) {
    SqliteDocumentTree::new(conn)
        .upsert_block(&BlockNode::new(id, BlockKind::Other, content))
        .unwrap();
}

fn apply(service: &Service<'_>, av_id: &str, action: Action) -> ApplyReport {
    service.apply(&Operation::new(av_id, action)).unwrap()
}

fn insert_bound(service: &Service<'_>, av_id: &str, ids: &[&str]) {
    apply(
        service,
        av_id,
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: ids.iter().map(|id| RowSource::bound(*id)).collect(),
        },
    );
}

fn add_column(service: &Service<'_>, av_id: &str, key_id: &str, name: &str, key_type: KeyType) {
    apply(
        service,
        av_id,
        Action::AddColumn {
            key_id: key_id.to_string(),
            name: name.to_string(),
            key_type,
            icon: String::new(),
            previous_key_id: None,
        },
    );
}

fn relate(service: &Service<'_>, av_id: &str, key_id: &str, target: &str, is_two_way: bool) {
    apply(
        service,
        av_id,
        Action::UpdateRelation {
            key_id: key_id.to_string(),
            target_av_id: target.to_string(),
            is_two_way,
            back_key_name: None,
        },
    );
}

fn set_relation(service: &Service<'_>, av_id: &str, key_id: &str, row_id: &str, ids: &[&str]) -> ApplyReport {
    apply(
        service,
        av_id,
        Action::UpdateCell {
            key_id: key_id.to_string(),
            row_id: row_id.to_string(),
            value: ValuePayload::relation(ids.iter().map(|id| id.to_string()).collect()),
        },
    )
}

fn back_key_id(service: &Service<'_>, dest: &str, src: &str) -> String {
    let av = service.store().load(dest).unwrap();
    let keys = av.relation_keys_to(src);
    assert_eq!(keys.len(), 1, "expected one back column in {dest}");
    keys[0].id.clone()
}

fn relation_ids(service: &Service<'_>, av_id: &str, key_id: &str, row_id: &str) -> Vec<String> {
    service
        .store()
        .load(av_id)
        .unwrap()
        .value(key_id, row_id)
        .and_then(|value| value.payload.relation_payload())
        .map(|relation| relation.block_ids.clone())
        .unwrap_or_default()
}

#[test]
fn two_way_relation_creates_back_column_and_stays_symmetric() {
    let conn = open_db_in_memory().unwrap();
    for (id, content) in [("r1", "Row one"), ("s1", "Target one"), ("s2", "Target two")] {
        add_block(&conn, id, content);
    }
    let sink = Arc::new(RecordingEventSink::new());
    let service = service(&conn).with_events(sink.clone());

    insert_bound(&service, "A", &["r1"]);
    insert_bound(&service, "B", &["s1", "s2"]);
    apply(&service, "A", Action::SetName { name: "Tasks".to_string() });
    add_column(&service, "A", "rel", "Links", KeyType::Relation);
    relate(&service, "A", "rel", "B", true);

    let back = back_key_id(&service, "B", "A");
    let b = service.store().load("B").unwrap();
    assert_eq!(b.key(&back).unwrap().name, "Tasks Links");
    assert!(b.views[0].table.column(&back).is_some());
    sink.take();

    let report = set_relation(&service, "A", "rel", "r1", &["s1", "s2"]);
    assert_eq!(report.saved, vec!["A".to_string(), "B".to_string()]);
    assert!(report
        .events
        .contains(&InvalidationEvent::new("B", InvalidationReason::BackRelationChanged)));
    assert_eq!(sink.take(), report.events);
    assert_eq!(relation_ids(&service, "B", &back, "s1"), vec!["r1".to_string()]);
    assert_eq!(relation_ids(&service, "B", &back, "s2"), vec!["r1".to_string()]);

    set_relation(&service, "A", "rel", "r1", &["s2"]);
    assert!(relation_ids(&service, "B", &back, "s1").is_empty());
    assert_eq!(relation_ids(&service, "B", &back, "s2"), vec!["r1".to_string()]);

    let table = service.render("A", &RenderRequest::default()).unwrap();
    assert_eq!(table.cell_text("r1", "rel").as_deref(), Some("Target two"));
}

#[test]
fn removing_two_way_column_removes_back_column() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Row one");
    add_block(&conn, "s1", "Target one");
    let service = service(&conn);

    insert_bound(&service, "A", &["r1"]);
    insert_bound(&service, "B", &["s1"]);
    add_column(&service, "A", "rel", "Links", KeyType::Relation);
    relate(&service, "A", "rel", "B", true);
    let back = back_key_id(&service, "B", "A");
    set_relation(&service, "A", "rel", "r1", &["s1"]);

    let report = apply(&service, "A", Action::RemoveColumn { key_id: "rel".to_string() });
    assert!(report
        .events
        .contains(&InvalidationEvent::new("B", InvalidationReason::ColumnRemoved)));

    let a = service.store().load("A").unwrap();
    let b = service.store().load("B").unwrap();
    assert!(!a.has_key("rel"));
    assert!(!b.has_key(&back));
    assert!(b.views[0].table.column(&back).is_none());
}

#[test]
fn removing_related_row_clears_back_reference() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Row one");
    add_block(&conn, "s1", "Target one");
    let service = service(&conn);

    insert_bound(&service, "A", &["r1"]);
    insert_bound(&service, "B", &["s1"]);
    add_column(&service, "A", "rel", "Links", KeyType::Relation);
    relate(&service, "A", "rel", "B", true);
    let back = back_key_id(&service, "B", "A");
    set_relation(&service, "A", "rel", "r1", &["s1"]);

    apply(&service, "A", Action::RemoveRows { row_ids: vec!["r1".to_string()] });
    assert!(relation_ids(&service, "B", &back, "s1").is_empty());
}

#[test]
fn rollup_sums_related_numbers() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    apply(
        &service,
        "B",
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: vec![RowSource::detached("s1", "First"), RowSource::detached("s2", "Second")],
        },
    );
    add_column(&service, "B", "score", "Score", KeyType::Number);
    for (row, score) in [("s1", 10.0), ("s2", 20.0)] {
        apply(
            &service,
            "B",
            Action::UpdateCell {
                key_id: "score".to_string(),
                row_id: row.to_string(),
                value: ValuePayload::number(score),
            },
        );
    }

    apply(
        &service,
        "A",
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: vec![RowSource::detached("r1", "Owner")],
        },
    );
    add_column(&service, "A", "rel", "Items", KeyType::Relation);
    relate(&service, "A", "rel", "B", false);
    add_column(&service, "A", "total", "Total", KeyType::Rollup);
    apply(
        &service,
        "A",
        Action::UpdateRollup {
            key_id: "total".to_string(),
            relation_key_id: "rel".to_string(),
            target_key_id: "score".to_string(),
            calc: Some(CalcOperator::Sum),
        },
    );
    set_relation(&service, "A", "rel", "r1", &["s1", "s2"]);

    let table = service.render("A", &RenderRequest::unpaged()).unwrap();
    assert_eq!(table.cell_text("r1", "total").as_deref(), Some("30"));
    assert_eq!(table.cell_text("r1", "rel").as_deref(), Some("First, Second"));

    apply(
        &service,
        "B",
        Action::UpdateCell {
            key_id: "score".to_string(),
            row_id: "s2".to_string(),
            value: ValuePayload::number(5.0),
        },
    );
    let table = service.render("A", &RenderRequest::unpaged()).unwrap();
    assert_eq!(table.cell_text("r1", "total").as_deref(), Some("15"));
}

#[test]
fn relation_to_missing_view_is_not_found() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    apply(
        &service,
        "A",
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: vec![RowSource::detached("r1", "Owner")],
        },
    );
    add_column(&service, "A", "rel", "Items", KeyType::Relation);
    let err = service
        .apply(&Operation::new(
            "A",
            Action::UpdateRelation {
                key_id: "rel".to_string(),
                target_av_id: "missing".to_string(),
                is_two_way: true,
                back_key_name: None,
            },
        ))
        .unwrap_err();
    assert_eq!(err.kind, attrview_core::TxErrorKind::NotFound);
    assert!(service.store().load("A").unwrap().key("rel").unwrap().relation().is_none());
}

fn relation_config(service: &Service<'_>, av_id: &str, key_id: &str) -> RelationConfig {
    service
        .store()
        .load(av_id)
        .unwrap()
        .key(key_id)
        .unwrap()
        .relation()
        .cloned()
        .unwrap()
}

#[test]
fn repointing_two_way_relation_moves_back_column() {
    let conn = open_db_in_memory().unwrap();
    for id in ["r1", "s1", "t1"] {
        add_block(&conn, id, id);
    }
    let service = service(&conn);
    insert_bound(&service, "A", &["r1"]);
    insert_bound(&service, "B", &["s1"]);
    insert_bound(&service, "C", &["t1"]);
    add_column(&service, "A", "rel", "Links", KeyType::Relation);
    relate(&service, "A", "rel", "B", true);
    assert_eq!(service.relation_index().sources_of("B"), vec!["A".to_string()]);
    let old_back = back_key_id(&service, "B", "A");

    relate(&service, "A", "rel", "C", true);

    let b = service.store().load("B").unwrap();
    assert!(b.relation_keys_to("A").is_empty());
    assert!(!b.has_key(&old_back));
    assert!(b.views[0].table.column(&old_back).is_none());
    let back = back_key_id(&service, "C", "A");
    let config = relation_config(&service, "A", "rel");
    assert_eq!(config.av_id, "C");
    assert_eq!(config.back_key_id, back);
    assert!(service.relation_index().sources_of("B").is_empty());
    assert_eq!(service.relation_index().sources_of("C"), vec!["A".to_string()]);
    assert_eq!(service.relation_index().sources_of("A"), vec!["C".to_string()]);
}

#[test]
fn turning_two_way_off_keeps_cells_and_drops_back_column() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Row one");
    add_block(&conn, "s1", "Target one");
    let service = service(&conn);
    insert_bound(&service, "A", &["r1"]);
    insert_bound(&service, "B", &["s1"]);
    add_column(&service, "A", "rel", "Links", KeyType::Relation);
    relate(&service, "A", "rel", "B", true);
    let back = back_key_id(&service, "B", "A");
    set_relation(&service, "A", "rel", "r1", &["s1"]);

    relate(&service, "A", "rel", "B", false);

    let b = service.store().load("B").unwrap();
    assert!(!b.has_key(&back));
    let config = relation_config(&service, "A", "rel");
    assert!(!config.is_two_way);
    assert!(config.back_key_id.is_empty());
    assert_eq!(relation_ids(&service, "A", "rel", "r1"), vec!["s1".to_string()]);
    assert!(service.relation_index().sources_of("A").is_empty());

    // One-way edits no longer touch the target.
    let report = set_relation(&service, "A", "rel", "r1", &[]);
    assert_eq!(report.saved, vec!["A".to_string()]);
}

#[test]
fn self_relation_links_rows_of_the_same_view() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Parent");
    add_block(&conn, "r2", "Child");
    let service = service(&conn);
    insert_bound(&service, "A", &["r1", "r2"]);
    apply(&service, "A", Action::SetName { name: "Tree".to_string() });
    add_column(&service, "A", "rel", "Children", KeyType::Relation);
    relate(&service, "A", "rel", "A", true);

    let back = relation_config(&service, "A", "rel").back_key_id;
    assert_eq!(
        service.store().load("A").unwrap().key(&back).unwrap().name,
        "Tree Children"
    );
    assert_eq!(relation_config(&service, "A", &back).back_key_id, "rel");

    let report = set_relation(&service, "A", "rel", "r1", &["r2"]);
    assert_eq!(report.saved, vec!["A".to_string()]);
    assert_eq!(relation_ids(&service, "A", &back, "r2"), vec!["r1".to_string()]);
    assert!(relation_ids(&service, "A", &back, "r1").is_empty());

    let table = service.render("A", &RenderRequest::unpaged()).unwrap();
    assert_eq!(table.cell_text("r1", "rel").as_deref(), Some("Child"));
    assert_eq!(table.cell_text("r2", &back).as_deref(), Some("Parent"));
}

#[test]
fn editing_back_column_updates_source_cells() {
    let conn = open_db_in_memory().unwrap();
    for id in ["r1", "r2", "s1"] {
        add_block(&conn, id, id);
    }
    let service = service(&conn);
    insert_bound(&service, "A", &["r1", "r2"]);
    insert_bound(&service, "B", &["s1"]);
    add_column(&service, "A", "rel", "Links", KeyType::Relation);
    relate(&service, "A", "rel", "B", true);
    let back = back_key_id(&service, "B", "A");

    let report = set_relation(&service, "B", &back, "s1", &["r1", "r2"]);
    assert!(report
        .events
        .contains(&InvalidationEvent::new("A", InvalidationReason::BackRelationChanged)));
    assert_eq!(relation_ids(&service, "A", "rel", "r1"), vec!["s1".to_string()]);
    assert_eq!(relation_ids(&service, "A", "rel", "r2"), vec!["s1".to_string()]);

    set_relation(&service, "B", &back, "s1", &["r2"]);
    assert!(relation_ids(&service, "A", "rel", "r1").is_empty());
    assert_eq!(relation_ids(&service, "A", "rel", "r2"), vec!["s1".to_string()]);
}

#[test]
fn updated_column_prefers_block_attribute_then_row_stamp() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Stamped");
    add_block(&conn, "r2", "Plain");
    let service = service(&conn);
    insert_bound(&service, "A", &["r1", "r2"]);
    add_column(&service, "A", "upd", "Updated", KeyType::Updated);
    service
        .docs()
        .set_block_attrs(
            "r1",
            &BTreeMap::from([("updated".to_string(), "20240306101112".to_string())]),
        )
        .unwrap();

    let table = service.render("A", &RenderRequest::unpaged()).unwrap();
    let stamp = |row_id: &str| {
        table
            .rows
            .iter()
            .find(|row| row.id == row_id)
            .and_then(|row| row.payload("upd"))
            .and_then(|payload| payload.as_millis())
    };
    let attr_time = parse_compact_time("20240306101112").unwrap().timestamp_millis();
    assert_eq!(stamp("r1"), Some(attr_time));

    let a = service.store().load("A").unwrap();
    let primary = a.primary_key().unwrap().id.clone();
    let row_stamp = a
        .value(&primary, "r2")
        .and_then(|value| value.payload.block())
        .map(|block| block.updated)
        .unwrap();
    assert_ne!(row_stamp, 0);
    assert_eq!(stamp("r2"), Some(row_stamp));
}

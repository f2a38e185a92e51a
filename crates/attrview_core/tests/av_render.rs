use attrview_core::db::open_db_in_memory;
use attrview_core::model::{FilterOperator, ViewFilter};
use attrview_core::repo::av_store::av_json_path;
use attrview_core::repo::history::HISTORY_DIR_LAYOUT;
use attrview_core::{
    Action, AttributeViewService, AvStore, BlockKind, BlockNode, EngineConfig, JsonFileAvStore,
    KeyType, Operation, RenderRequest, RowSource, SqliteAvStore, SqliteDocumentTree, TxErrorKind,
    ValuePayload,
};
use chrono::{Local, TimeZone};
use rusqlite::Connection;

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

fn apply(service: &Service<'_>, av_id: &str, action: Action) {
    service.apply(&Operation::new(av_id, action)).unwrap();
}

fn insert_detached(service: &Service<'_>, av_id: &str, ids: &[&str]) {
    apply(
        service,
        av_id,
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: ids
                .iter()
                .map(|id| RowSource::detached(*id, id.to_uppercase()))
                .collect(),
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

fn set_cell(service: &Service<'_>, av_id: &str, key_id: &str, row_id: &str, value: ValuePayload) {
    apply(
        service,
        av_id,
        Action::UpdateCell {
            key_id: key_id.to_string(),
            row_id: row_id.to_string(),
            value,
        },
    );
}

#[test]
fn contains_filter_keeps_matching_rows() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Alice");
    add_block(&conn, "r2", "Bob");
    let service = service(&conn);

    apply(
        &service,
        "A",
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: vec![RowSource::bound("r1"), RowSource::bound("r2")],
        },
    );
    add_column(&service, "A", "name", "Name", KeyType::Text);
    set_cell(&service, "A", "name", "r1", ValuePayload::text("Alice"));
    set_cell(&service, "A", "name", "r2", ValuePayload::text("Bob"));
    apply(
        &service,
        "A",
        Action::SetFilters {
            view_id: None,
            filters: vec![ViewFilter {
                column: "name".to_string(),
                operator: FilterOperator::Contains,
                value: Some(ValuePayload::text("Ali")),
                value2: None,
            }],
        },
    );

    let request = RenderRequest {
        page: 1,
        page_size: Some(10),
        ..RenderRequest::default()
    };
    let table = service.render("A", &request).unwrap();
    assert_eq!(table.row_ids(), vec!["r1"]);
    assert_eq!(table.row_count, 1);
    assert_eq!(table.cell_text("r1", "name").as_deref(), Some("Alice"));
}

#[test]
fn pages_slice_filtered_rows() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    insert_detached(&service, "A", &["x1", "x2", "x3", "x4", "x5"]);

    let page = |page: usize| {
        service
            .render(
                "A",
                &RenderRequest {
                    page,
                    page_size: Some(2),
                    ..RenderRequest::default()
                },
            )
            .unwrap()
    };
    let first = page(1);
    assert_eq!(first.row_count, 5);
    assert_eq!(first.row_ids(), vec!["x1", "x2"]);
    assert_eq!(page(3).row_ids(), vec!["x5"]);
    assert!(page(4).rows.is_empty());
}

#[test]
fn rendering_twice_is_identical() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Alice");
    let service = service(&conn);
    apply(
        &service,
        "A",
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: vec![RowSource::bound("r1"), RowSource::detached("d1", "Loose")],
        },
    );
    add_column(&service, "A", "n", "N", KeyType::Number);
    set_cell(&service, "A", "n", "d1", ValuePayload::number(3.5));

    let first = service.render("A", &RenderRequest::default()).unwrap();
    let second = service.render("A", &RenderRequest::default()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn render_creates_missing_attribute_view() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let table = service.render("fresh", &RenderRequest::default()).unwrap();
    assert!(table.rows.is_empty());
    assert_eq!(table.columns.len(), 1);
    let stored = service.store().load("fresh").unwrap();
    assert_eq!(stored.views.len(), 1);
}

#[test]
fn explicit_view_becomes_active() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    insert_detached(&service, "A", &["x1"]);
    let first_view = service.store().load("A").unwrap().views[0].id.clone();
    apply(
        &service,
        "A",
        Action::AddView {
            view_id: "v2".to_string(),
            name: "Second".to_string(),
        },
    );
    assert_eq!(service.store().load("A").unwrap().active_view_id, "v2");

    let table = service
        .render("A", &RenderRequest::view(first_view.clone()))
        .unwrap();
    assert_eq!(table.view_id, first_view);
    assert_eq!(table.views.len(), 2);
    assert_eq!(service.store().load("A").unwrap().active_view_id, first_view);
}

#[test]
fn removing_last_view_is_rejected_without_changes() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    insert_detached(&service, "A", &["x1"]);
    let before = service.store().load("A").unwrap();

    let err = service
        .apply(&Operation::new(
            "A",
            Action::RemoveView {
                view_id: before.views[0].id.clone(),
            },
        ))
        .unwrap_err();
    assert_eq!(err.kind, TxErrorKind::InvariantViolation);
    assert_eq!(err.av_id, "A");
    assert_eq!(service.store().load("A").unwrap(), before);
}

#[test]
fn bound_row_without_block_is_hidden_but_kept() {
    let conn = open_db_in_memory().unwrap();
    add_block(&conn, "r1", "Alice");
    add_block(&conn, "r2", "Bob");
    let service = service(&conn);
    apply(
        &service,
        "A",
        Action::InsertRows {
            view_id: None,
            previous_id: None,
            rows: vec![RowSource::bound("r1"), RowSource::bound("r2")],
        },
    );
    SqliteDocumentTree::new(&conn).delete_block("r2").unwrap();

    let table = service.render("A", &RenderRequest::default()).unwrap();
    assert_eq!(table.row_ids(), vec!["r1"]);
    assert!(service.store().load("A").unwrap().has_row("r2"));
}

#[test]
fn new_row_inherits_filter_value() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    insert_detached(&service, "A", &["x1"]);
    add_column(&service, "A", "done", "Done", KeyType::Checkbox);
    apply(
        &service,
        "A",
        Action::SetFilters {
            view_id: None,
            filters: vec![ViewFilter {
                column: "done".to_string(),
                operator: FilterOperator::IsTrue,
                value: None,
                value2: None,
            }],
        },
    );
    insert_detached(&service, "A", &["x2"]);

    let table = service.render("A", &RenderRequest::default()).unwrap();
    assert_eq!(table.row_ids(), vec!["x2"]);
}

#[test]
fn history_render_prefers_archive_then_live_copy() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::from_workspace(dir.path()).unwrap();
    let conn = open_db_in_memory().unwrap();
    let service = AttributeViewService::new(
        JsonFileAvStore::new(config.data_dir.clone()),
        SqliteDocumentTree::new(&conn),
        config.clone(),
    );
    let err = service
        .apply(&Operation::new(
            "A",
            Action::SetName {
                name: "Live".to_string(),
            },
        ))
        .unwrap_err();
    assert_eq!(err.kind, TxErrorKind::NotFound);
    service
        .apply(&Operation::new(
            "A",
            Action::InsertRows {
                view_id: None,
                previous_id: None,
                rows: vec![RowSource::detached("x1", "One")],
            },
        ))
        .unwrap();

    let created_unix = 1_700_000_000;
    let prefix = Local
        .timestamp_opt(created_unix, 0)
        .single()
        .unwrap()
        .format(HISTORY_DIR_LAYOUT)
        .to_string();
    let archive = config.history_dir.join(format!("{prefix}-update"));
    let mut archived = service.store().load("A").unwrap();
    archived.name = "Archived".to_string();
    let path = av_json_path(&archive, "A");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, serde_json::to_string(&archived).unwrap()).unwrap();

    let table = service.render_history("A", created_unix).unwrap();
    assert_eq!(table.av_name, "Archived");
    assert_eq!(table.row_ids(), vec!["x1"]);

    let table = service.render_history("A", created_unix + 3600).unwrap();
    assert_eq!(table.av_name, "");
    assert_eq!(table.row_ids(), vec!["x1"]);
}

#[test]
fn stored_render_never_creates_views() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let err = service
        .render_stored("A", &RenderRequest::default())
        .unwrap_err();
    assert_eq!(err.kind, TxErrorKind::NotFound);
    assert!(!service.store().exists("A").unwrap());

    insert_detached(&service, "A", &["x1"]);
    let table = service.render_stored("A", &RenderRequest::default()).unwrap();
    assert_eq!(table.row_ids(), vec!["x1"]);
}

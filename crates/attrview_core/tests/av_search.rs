use attrview_core::db::open_db_in_memory;
use attrview_core::model::AttributeView;
use attrview_core::{
    search_attribute_views, AvStore, BlockKind, BlockNode, SearchError, SqliteAvStore,
    SqliteDocumentTree,
};
use rusqlite::Connection;

fn add_av_block(conn: &Connection, id: &str, av_id: &str, content: &str, updated: i64) {
    let mut node = BlockNode::new(id, BlockKind::AttributeView, content);
    node.av_id = Some(av_id.to_string());
    node.hpath = format!("/notes/{id}");
    node.updated = updated;
    SqliteDocumentTree::new(conn).upsert_block(&node).unwrap();
}

fn save_named(conn: &Connection, av_id: &str, name: &str) {
    let mut av = AttributeView::new(av_id);
    av.name = name.to_string();
    av.ensure_default_view();
    SqliteAvStore::new(conn).save(&av).unwrap();
}

#[test]
fn keyword_hits_are_deduplicated_per_attribute_view() {
    let conn = open_db_in_memory().unwrap();
    save_named(&conn, "av-tasks", "Tasks");
    add_av_block(&conn, "b1", "av-tasks", "weekly tasks board", 1);
    add_av_block(&conn, "b2", "av-tasks", "tasks again", 2);
    add_av_block(&conn, "b3", "av-books", "reading list", 3);
    SqliteDocumentTree::new(&conn)
        .upsert_block(&BlockNode::new("p1", BlockKind::Other, "tasks in prose"))
        .unwrap();

    let store = SqliteAvStore::new(&conn);
    let hits = search_attribute_views(&conn, &store, "tasks", 1, 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].av_id, "av-tasks");
    assert_eq!(hits[0].av_name, "Tasks");
    assert!(hits[0].hpath.starts_with("/notes/"));
}

#[test]
fn blank_keyword_lists_recent_attribute_views() {
    let conn = open_db_in_memory().unwrap();
    add_av_block(&conn, "b1", "av-old", "old", 10);
    add_av_block(&conn, "b2", "av-new", "new", 20);

    let store = SqliteAvStore::new(&conn);
    let hits = search_attribute_views(&conn, &store, "   ", 1, 10).unwrap();
    let ids: Vec<&str> = hits.iter().map(|hit| hit.av_id.as_str()).collect();
    assert_eq!(ids, vec!["av-new", "av-old"]);
    assert!(hits.iter().all(|hit| hit.av_name.is_empty()));

    let second_page = search_attribute_views(&conn, &store, "", 2, 1).unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].av_id, "av-old");
    assert!(search_attribute_views(&conn, &store, "", 3, 1).unwrap().is_empty());
}

#[test]
fn quoted_keyword_is_not_a_syntax_error() {
    let conn = open_db_in_memory().unwrap();
    add_av_block(&conn, "b1", "av-1", "say \"hi\"", 1);
    let store = SqliteAvStore::new(&conn);
    let result = search_attribute_views(&conn, &store, "\"hi", 1, 10);
    assert!(!matches!(result, Err(SearchError::InvalidQuery { .. })));
}

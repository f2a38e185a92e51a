use attrview_core::db::migrations::{current_user_version, latest_version};
use attrview_core::db::{open_db, open_db_in_memory, DbError};
use attrview_core::repo::document::DocumentTree;
use attrview_core::{BlockKind, BlockNode, SqliteDocumentTree};
use rusqlite::Connection;
use std::collections::BTreeMap;

fn table_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [name],
        |row| row.get::<_, i64>(0),
    )
    .unwrap()
        == 1
}

fn fts_hits(conn: &Connection, term: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM blocks_fts WHERE blocks_fts MATCH ?1",
        [term],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn fresh_database_has_document_and_attribute_view_tables() {
    let conn = open_db_in_memory().unwrap();
    assert_eq!(current_user_version(&conn).unwrap(), latest_version());
    for table in ["blocks", "block_attrs", "blocks_fts", "attribute_views"] {
        assert!(table_exists(&conn, table), "missing table {table}");
    }
}

#[test]
fn document_only_database_is_upgraded_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attrview.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE blocks (id TEXT PRIMARY KEY NOT NULL, root_id TEXT NOT NULL,
                type TEXT NOT NULL, content TEXT NOT NULL DEFAULT '', hpath TEXT NOT NULL DEFAULT '',
                av_id TEXT, updated INTEGER NOT NULL DEFAULT 0);
             PRAGMA user_version = 1;",
        )
        .unwrap();
    }

    let conn = open_db(&path).unwrap();
    assert_eq!(current_user_version(&conn).unwrap(), latest_version());
    assert!(table_exists(&conn, "attribute_views"));
    drop(conn);

    let reopened = open_db(&path).unwrap();
    assert_eq!(current_user_version(&reopened).unwrap(), latest_version());
}

#[test]
fn newer_schema_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");
    Connection::open(&path)
        .unwrap()
        .execute_batch("PRAGMA user_version = 999;")
        .unwrap();

    assert!(matches!(
        open_db(&path),
        Err(DbError::UnsupportedSchemaVersion { db_version: 999, latest_supported })
            if latest_supported == latest_version()
    ));
    let message = open_db(&path).unwrap_err().to_string();
    assert!(message.contains("schema 999"), "{message}");
}

#[test]
fn broken_migration_names_the_failing_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.db");
    Connection::open(&path)
        .unwrap()
        .execute_batch("CREATE TABLE blocks (id TEXT PRIMARY KEY);")
        .unwrap();

    let err = open_db(&path).unwrap_err();
    assert!(matches!(
        err,
        DbError::Migration { version: 1, name: "documents", .. }
    ));
    assert!(err.to_string().contains("migration 1 (documents)"));
    let conn = Connection::open(&path).unwrap();
    assert_eq!(current_user_version(&conn).unwrap(), 0);
}

#[test]
fn block_index_follows_content_and_deletes() {
    let conn = open_db_in_memory().unwrap();
    let docs = SqliteDocumentTree::new(&conn);
    docs.upsert_block(&BlockNode::new("b1", BlockKind::Other, "draft plan"))
        .unwrap();
    docs.set_block_attrs(
        "b1",
        &BTreeMap::from([("custom-avs".to_string(), "av1".to_string())]),
    )
    .unwrap();
    assert_eq!(fts_hits(&conn, "draft"), 1);

    docs.upsert_block(&BlockNode::new("b1", BlockKind::Other, "final plan"))
        .unwrap();
    assert_eq!(fts_hits(&conn, "draft"), 0);
    assert_eq!(fts_hits(&conn, "final"), 1);

    assert!(docs.delete_block("b1").unwrap());
    assert_eq!(fts_hits(&conn, "plan"), 0);
    assert!(docs.get_block_attrs("b1").unwrap().is_empty());
}

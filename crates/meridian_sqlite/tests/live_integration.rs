//! End-to-end coverage against a real SQLite file: table creation, CRUD,
//! one-to-many and many-to-many joins, reconcile, and transaction rollback.

use meridian_core::{col, CreatePolicy, Database, UpdateKeys};
use meridian_sqlite::{SqliteConfig, SqliteDriver};
use meridian_test_support::fixtures::{sample_author, sample_post, sample_tag, Author, Post, PostTag, Tag};

fn open_file_db() -> (Database, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let path = temp_dir.path().join("live.sqlite");
    let db = Database::open::<SqliteDriver>(SqliteConfig::file(path)).expect("open sqlite file");
    (db, temp_dir)
}

#[test]
fn create_insert_and_select_round_trip() {
    let (db, _dir) = open_file_db();
    db.create::<Author>(CreatePolicy::default()).unwrap();

    let affected = db.table::<Author>().insert(vec![sample_author(1, "Lin")]).unwrap();
    assert_eq!(affected, 1);

    let authors = db.table::<Author>().select().unwrap();
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0], sample_author(1, "Lin"));
}

#[test]
fn standard_join_attaches_ordered_children_per_parent() {
    let (db, _dir) = open_file_db();
    db.create::<Author>(CreatePolicy::default()).unwrap();
    db.create::<Post>(CreatePolicy::default()).unwrap();

    db.table::<Author>().insert(vec![sample_author(1, "Lin"), sample_author(2, "Noor")]).unwrap();
    db.table::<Post>()
        .insert(vec![
            sample_post(10, 1, "Second"),
            sample_post(11, 1, "First"),
            sample_post(12, 2, "Only"),
        ])
        .unwrap();

    let authors = db
        .table::<Author>()
        .join::<Post>("posts", "id", "author_id")
        .unwrap()
        .order("title", meridian_core::OrderDirection::Ascending)
        .select()
        .unwrap();

    assert_eq!(authors.len(), 2);
    let lin = authors.iter().find(|a| a.id == 1).unwrap();
    let titles: Vec<&str> = lin.posts.as_ref().unwrap().iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["First", "Second"]);

    let noor = authors.iter().find(|a| a.id == 2).unwrap();
    assert_eq!(noor.posts.as_ref().unwrap().len(), 1);
}

#[test]
fn per_side_ordering_and_cross_form_predicate() {
    let (db, _dir) = open_file_db();
    db.create::<Author>(CreatePolicy::default()).unwrap();
    db.create::<Post>(CreatePolicy::default()).unwrap();

    db.table::<Author>().insert(vec![sample_author(1, "Lars"), sample_author(2, "Noor")]).unwrap();
    db.table::<Post>()
        .insert(vec![
            sample_post(10, 1, "Alpha"),
            Post { id: 11, author_id: 1, title: "Draft".to_string(), published: false, tags: None },
            sample_post(12, 1, "Zeta"),
            sample_post(13, 2, "Other"),
        ])
        .unwrap();

    let authors = db
        .table::<Author>()
        .order("name", meridian_core::OrderDirection::Ascending)
        .join::<Post>("posts", "id", "author_id")
        .unwrap()
        .order("title", meridian_core::OrderDirection::Descending)
        .r#where(col::<Author>("name").eq("Lars") & col::<Post>("published").eq(true))
        .unwrap()
        .select()
        .unwrap();

    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].name, "Lars");
    let titles: Vec<&str> = authors[0].posts.as_ref().unwrap().iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Zeta", "Alpha"]);
}

#[test]
fn pivot_join_attaches_tags_through_the_join_table() {
    let (db, _dir) = open_file_db();
    db.create::<Post>(CreatePolicy::default()).unwrap();
    db.create::<Tag>(CreatePolicy::default()).unwrap();
    db.create::<PostTag>(CreatePolicy::default()).unwrap();

    db.table::<Post>().insert(vec![sample_post(1, 1, "Launch")]).unwrap();
    db.table::<Tag>().insert(vec![sample_tag(100, "rust"), sample_tag(101, "orm")]).unwrap();
    db.table::<PostTag>()
        .insert(vec![
            PostTag { id: 1000, post_id: 1, tag_id: 100 },
            PostTag { id: 1001, post_id: 1, tag_id: 101 },
        ])
        .unwrap();

    let posts = db
        .table::<Post>()
        .pivot_join::<Tag, PostTag>("tags", "id", "post_id", "id", "tag_id")
        .unwrap()
        .select()
        .unwrap();

    assert_eq!(posts.len(), 1);
    let tags = posts[0].tags.as_ref().unwrap();
    assert_eq!(tags.len(), 2);
    let mut labels: Vec<&str> = tags.iter().map(|t| t.label.as_str()).collect();
    labels.sort_unstable();
    assert_eq!(labels, vec!["orm", "rust"]);
}

#[test]
fn update_with_set_keys_writes_only_named_fields() {
    let (db, _dir) = open_file_db();
    db.create::<Author>(CreatePolicy::default()).unwrap();
    db.table::<Author>().insert(vec![sample_author(1, "Lin")]).unwrap();

    let affected = db
        .table::<Author>()
        .r#where(col::<Author>("id").eq(1i64))
        .unwrap()
        .update(sample_author(1, "Someone Else"), UpdateKeys::Set(vec!["name"]))
        .unwrap();
    assert_eq!(affected, 1);

    let authors = db.table::<Author>().select().unwrap();
    assert_eq!(authors[0].name, "Someone Else");
}

fn table_columns(path: &std::path::Path, table: &str) -> Vec<String> {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})")).unwrap();
    stmt.query_map([], |row| row.get::<_, String>(1))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

#[test]
fn reconcile_adds_and_drops_columns_between_runs() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("reconcile.sqlite");
    let db = Database::open::<SqliteDriver>(SqliteConfig::file(path.clone())).unwrap();
    db.create::<Author>(CreatePolicy::default()).unwrap();

    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("ALTER TABLE authors ADD COLUMN legacy TEXT", []).unwrap();
    }
    assert!(table_columns(&path, "authors").iter().any(|c| c == "legacy"));

    db.create::<Author>(CreatePolicy::default().reconcile_table()).unwrap();
    let after = table_columns(&path, "authors");
    assert!(!after.iter().any(|c| c == "legacy"));
    assert!(after.iter().any(|c| c == "name"));
}

#[test]
fn transaction_rolls_back_on_inner_failure() {
    let (db, _dir) = open_file_db();
    db.create::<Author>(CreatePolicy::default()).unwrap();
    db.table::<Author>().insert(vec![sample_author(1, "Lin")]).unwrap();

    let result = db.transaction(|tx| -> Result<(), meridian_core::Error> {
        tx.table::<Author>().insert(vec![sample_author(2, "Noor")])?;
        tx.transaction(|inner| -> Result<(), meridian_core::Error> {
            inner.table::<Author>().insert(vec![sample_author(3, "Marco")])?;
            Err(meridian_core::Error::Schema(meridian_core::SchemaError::AmbiguousPrimaryKey { first: "id", second: "id2" }))
        })
    });
    assert!(result.is_err());

    let authors = db.table::<Author>().select().unwrap();
    assert_eq!(authors.len(), 1, "nested failure must roll back the whole transaction");
}

//! Engine-level coverage over the in-memory fake driver: chain semantics,
//! predicate routing between principal and child-load statements, limits,
//! null handling, and count/select agreement.

use meridian_core::{
    col, CreatePolicy, Database, Error, OrderDirection, QueryError, SqlGenError, UpdateKeys,
};
use meridian_test_support::fake_driver::FakeConfig;
use meridian_test_support::fixtures::{
    sample_author, sample_post, sample_tag, Author, Event, Post, PostTag, Tag,
};
use meridian_test_support::FakeDriver;

fn open() -> Database {
    Database::open::<FakeDriver>(FakeConfig).expect("open fake driver")
}

fn open_with_authors(authors: Vec<Author>) -> Database {
    let db = open();
    db.create::<Author>(CreatePolicy::default()).unwrap();
    db.table::<Author>().insert(authors).unwrap();
    db
}

#[test]
fn count_agrees_with_materialized_select_length() {
    let db = open_with_authors(vec![
        sample_author(1, "Lin"),
        sample_author(2, "Noor"),
        sample_author(3, "Marco"),
    ]);

    let selected = db.table::<Author>().r#where(col::<Author>("id").ge(2i64)).unwrap().select().unwrap();
    let counted = db.table::<Author>().r#where(col::<Author>("id").ge(2i64)).unwrap().count().unwrap();
    assert_eq!(selected.len() as u64, counted);
    assert_eq!(counted, 2);
}

#[test]
fn negated_conjunction_matches_disjunction_of_negations() {
    let db = open_with_authors(vec![
        sample_author(1, "Lin"),
        sample_author(2, "Noor"),
        sample_author(3, "Marco"),
    ]);

    let both = col::<Author>("name").eq("Lin") & col::<Author>("id").eq(1i64);
    let negated = db.table::<Author>().r#where(!both).unwrap().select().unwrap();

    let either = !col::<Author>("name").eq("Lin") | !col::<Author>("id").eq(1i64);
    let rewritten = db.table::<Author>().r#where(either).unwrap().select().unwrap();

    assert_eq!(negated, rewritten);
    assert_eq!(negated.len(), 2);
}

#[test]
fn inserting_zero_rows_is_a_noop_that_succeeds() {
    let db = open_with_authors(vec![]);
    let affected = db.table::<Author>().insert(vec![]).unwrap();
    assert_eq!(affected, 0);
    assert_eq!(db.table::<Author>().count().unwrap(), 0);
}

#[test]
fn limit_zero_yields_no_rows_even_with_an_active_join() {
    let db = open_with_authors(vec![sample_author(1, "Lin")]);
    db.create::<Post>(CreatePolicy::default()).unwrap();
    db.table::<Post>().insert(vec![sample_post(10, 1, "First")]).unwrap();

    let authors = db
        .table::<Author>()
        .limit(0, 0)
        .join::<Post>("posts", "id", "author_id")
        .unwrap()
        .select()
        .unwrap();
    assert!(authors.is_empty());
}

#[test]
fn limit_and_offset_apply_to_the_ordered_principal() {
    let db = open_with_authors(vec![
        sample_author(1, "Lin"),
        sample_author(2, "Noor"),
        sample_author(3, "Marco"),
    ]);

    let page = db
        .table::<Author>()
        .order("id", OrderDirection::Ascending)
        .limit(2, 1)
        .select()
        .unwrap();
    let ids: Vec<i64> = page.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn order_and_limit_after_a_join_constrain_the_children() {
    let db = open_with_authors(vec![sample_author(1, "Lin")]);
    db.create::<Post>(CreatePolicy::default()).unwrap();
    db.table::<Post>()
        .insert(vec![
            sample_post(10, 1, "Alpha"),
            sample_post(11, 1, "Middle"),
            sample_post(12, 1, "Zeta"),
        ])
        .unwrap();

    let authors = db
        .table::<Author>()
        .join::<Post>("posts", "id", "author_id")
        .unwrap()
        .order("title", OrderDirection::Descending)
        .limit(2, 0)
        .select()
        .unwrap();

    let titles: Vec<&str> = authors[0].posts.as_ref().unwrap().iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Zeta", "Middle"]);
}

#[test]
fn predicate_atoms_route_to_the_statement_owning_their_form() {
    let db = open_with_authors(vec![sample_author(1, "Lars"), sample_author(2, "Noor")]);
    db.create::<Post>(CreatePolicy::default()).unwrap();
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
        .order("name", OrderDirection::Ascending)
        .join::<Post>("posts", "id", "author_id")
        .unwrap()
        .order("title", OrderDirection::Descending)
        .r#where(col::<Author>("name").eq("Lars") & col::<Post>("published").eq(true))
        .unwrap()
        .select()
        .unwrap();

    assert_eq!(authors.len(), 1, "the author atom must filter the principal");
    let titles: Vec<&str> = authors[0].posts.as_ref().unwrap().iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Zeta", "Alpha"], "the post atom must filter and order the child load");
}

#[test]
fn unjoined_collection_is_absent_while_joined_empty_is_an_empty_sequence() {
    let db = open_with_authors(vec![sample_author(1, "Lin")]);
    db.create::<Post>(CreatePolicy::default()).unwrap();

    let plain = db.table::<Author>().select().unwrap();
    assert!(plain[0].posts.is_none());

    let joined = db.table::<Author>().join::<Post>("posts", "id", "author_id").unwrap().select().unwrap();
    assert_eq!(joined[0].posts, Some(vec![]));
}

#[test]
fn null_comparison_counts_only_rows_with_a_null_column() {
    let db = open();
    db.create::<Event>(CreatePolicy::default()).unwrap();
    db.table::<Event>()
        .insert(vec![
            Event {
                id: meridian_core::uuid::Uuid::new_v4(),
                name: "with payload".to_string(),
                happened_at: meridian_core::chrono::Utc::now(),
                payload: Some(vec![1, 2, 3]),
            },
            Event {
                id: meridian_core::uuid::Uuid::new_v4(),
                name: "without payload".to_string(),
                happened_at: meridian_core::chrono::Utc::now(),
                payload: None,
            },
        ])
        .unwrap();

    let nulls = db.table::<Event>().r#where(col::<Event>("payload").is_null()).unwrap().count().unwrap();
    assert_eq!(nulls, 1);
}

#[test]
fn delete_then_count_over_the_same_predicate_is_zero() {
    let db = open_with_authors(vec![sample_author(1, "Lin"), sample_author(2, "Noor")]);

    let deleted = db.table::<Author>().r#where(col::<Author>("id").eq(1i64)).unwrap().delete().unwrap();
    assert_eq!(deleted, 1);
    let left = db.table::<Author>().r#where(col::<Author>("id").eq(1i64)).unwrap().count().unwrap();
    assert_eq!(left, 0);
    assert_eq!(db.table::<Author>().count().unwrap(), 1);
}

#[test]
fn predicate_over_a_form_outside_the_chain_fails_before_execution() {
    let db = open_with_authors(vec![sample_author(1, "Lin")]);

    let err = db.table::<Author>().r#where(col::<Post>("title").eq("x")).err().unwrap();
    assert!(matches!(err, Error::SqlGen(SqlGenError::UnresolvedForm { form: "Post", .. })), "{err}");
}

#[test]
fn predicate_over_an_unknown_column_fails_before_execution() {
    let db = open_with_authors(vec![sample_author(1, "Lin")]);

    let err = db.table::<Author>().r#where(col::<Author>("nope").eq(1i64)).err().unwrap();
    assert!(matches!(err, Error::SqlGen(SqlGenError::UnknownColumn { column: "nope", .. })), "{err}");
}

#[test]
fn joining_the_same_field_twice_is_rejected() {
    let db = open_with_authors(vec![]);

    let err = db
        .table::<Author>()
        .join::<Post>("posts", "id", "author_id")
        .unwrap()
        .join::<Post>("posts", "id", "author_id")
        .err()
        .unwrap();
    assert!(matches!(err, Error::Query(QueryError::DuplicateJoin { field: "posts" })), "{err}");
}

#[test]
fn joining_a_column_field_is_rejected() {
    let db = open_with_authors(vec![]);

    let err = db.table::<Author>().join::<Post>("name", "id", "author_id").err().unwrap();
    assert!(matches!(err, Error::Query(QueryError::NotAChildCollection { field: "name", .. })), "{err}");
}

#[test]
fn update_with_ignore_keys_leaves_the_ignored_columns_alone() {
    let db = open();
    db.create::<Post>(CreatePolicy::default()).unwrap();
    db.table::<Post>().insert(vec![sample_post(1, 1, "Original")]).unwrap();

    db.table::<Post>()
        .r#where(col::<Post>("id").eq(1i64))
        .unwrap()
        .update(
            Post { id: 1, author_id: 9, title: "Rewritten".to_string(), published: false, tags: None },
            UpdateKeys::Ignore(vec!["title"]),
        )
        .unwrap();

    let posts = db.table::<Post>().select().unwrap();
    assert_eq!(posts[0].title, "Original");
    assert_eq!(posts[0].author_id, 9);
    assert!(!posts[0].published);
}

#[test]
fn pivot_join_yields_the_distinct_child_set_per_parent() {
    let db = open();
    db.create::<Post>(CreatePolicy::default()).unwrap();
    db.create::<Tag>(CreatePolicy::default()).unwrap();
    db.create::<PostTag>(CreatePolicy::default()).unwrap();

    db.table::<Post>().insert(vec![sample_post(1, 1, "Launch")]).unwrap();
    db.table::<Tag>().insert(vec![sample_tag(100, "rust")]).unwrap();
    // The same tag attached twice through two distinct pivot rows.
    db.table::<PostTag>()
        .insert(vec![
            PostTag { id: 1000, post_id: 1, tag_id: 100 },
            PostTag { id: 1001, post_id: 1, tag_id: 100 },
        ])
        .unwrap();

    let posts = db
        .table::<Post>()
        .pivot_join::<Tag, PostTag>("tags", "id", "post_id", "id", "tag_id")
        .unwrap()
        .select()
        .unwrap();

    assert_eq!(posts[0].tags.as_ref().unwrap().len(), 1);
}

#[test]
fn insert_then_select_by_primary_key_round_trips_every_column() {
    let db = open_with_authors(vec![sample_author(7, "Imre")]);

    let found = db
        .table::<Author>()
        .r#where(col::<Author>("id").eq(7i64))
        .unwrap()
        .select()
        .unwrap();
    assert_eq!(found, vec![sample_author(7, "Imre")]);
}

#[test]
fn transaction_rollback_restores_the_previous_row_set() {
    let db = open_with_authors(vec![sample_author(1, "Lin")]);

    let result: Result<(), Error> = db.transaction(|tx| {
        tx.table::<Author>().insert(vec![sample_author(2, "Noor")])?;
        Err(Error::Query(QueryError::MissingPrimaryKey { form: "Author" }))
    });
    assert!(result.is_err());
    assert_eq!(db.table::<Author>().count().unwrap(), 1);
}

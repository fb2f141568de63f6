//! Record fixtures shared across the workspace's test suites: a one-to-many
//! pair (`Author`/`Post`), a many-to-many pair joined through a pivot table
//! (`Post`/`Tag` via `PostTag`), and a record exercising the `Date`/`Uuid`
//! primitives (`Event`).

use chrono::{DateTime, Utc};
use meridian_macros::Record;
use uuid::Uuid;

#[derive(Record, Debug, Clone, PartialEq)]
#[meridian(table = "authors")]
pub struct Author {
    #[meridian(primary_key)]
    pub id: i64,
    pub name: String,
    pub posts: Option<Vec<Post>>,
}

#[derive(Record, Debug, Clone, PartialEq)]
#[meridian(table = "posts")]
pub struct Post {
    #[meridian(primary_key)]
    pub id: i64,
    pub author_id: i64,
    pub title: String,
    pub published: bool,
    pub tags: Option<Vec<Tag>>,
}

#[derive(Record, Debug, Clone, PartialEq)]
#[meridian(table = "tags")]
pub struct Tag {
    #[meridian(primary_key)]
    pub id: i64,
    pub label: String,
}

/// The join table behind `Post::tags`. Not a child collection of anything
/// itself, so it never appears on the right-hand side of a `join`/`pivot_join`
/// call; it is named only as the `P` type parameter of `pivot_join`.
#[derive(Record, Debug, Clone, PartialEq)]
#[meridian(table = "post_tags")]
pub struct PostTag {
    #[meridian(primary_key)]
    pub id: i64,
    pub post_id: i64,
    pub tag_id: i64,
}

#[derive(Record, Debug, Clone, PartialEq)]
#[meridian(table = "events")]
pub struct Event {
    #[meridian(primary_key)]
    pub id: Uuid,
    pub name: String,
    pub happened_at: DateTime<Utc>,
    pub payload: Option<Vec<u8>>,
}

pub fn sample_author(id: i64, name: impl Into<String>) -> Author {
    Author { id, name: name.into(), posts: None }
}

pub fn sample_post(id: i64, author_id: i64, title: impl Into<String>) -> Post {
    Post { id, author_id, title: title.into(), published: true, tags: None }
}

pub fn sample_tag(id: i64, label: impl Into<String>) -> Tag {
    Tag { id, label: label.into() }
}

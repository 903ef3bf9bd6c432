//! Pagination and Sorting Tests
//!
//! - Walking a result set page by page with cursors visits every document
//!   exactly once, in sort order
//! - hasNextPage is false only on the last page
//! - Sorting follows relations and falls back to the id on ties
//! - Classic skip/limit paging and the configured page size bound

mod common;

use common::{empty_fixture, fixture_with, seeded_fixture, Fixture};
use polystore::config::PaginationConfig;
use polystore::{Method, Query, ResolverConfig, SortDirection, SortSpec};
use serde_json::{json, Value};

fn seed_people(fixture: &Fixture, n: usize) {
    let docs = (0..n)
        .map(|i| json!({"_id": format!("p{:02}", i), "name": format!("n{}", i), "years": (i * 5 + 3) % 4}))
        .collect();
    fixture.people.seed("Person", docs).unwrap();
}

fn ids(docs: &[Value]) -> Vec<String> {
    docs.iter()
        .filter_map(|d| d["id"].as_str().map(str::to_string))
        .collect()
}

fn by_age() -> Query {
    Query::new("Person", Method::Find)
        .sort(vec![SortSpec::asc("age")])
        .unwrap()
}

// =============================================================================
// Cursor Round-Trip Tests
// =============================================================================

/// Concatenated pages equal the unpaginated sorted result.
#[tokio::test]
async fn test_cursor_walk_visits_everything_once() {
    for (n, page_size) in [(7usize, 3i64), (6, 3), (5, 1), (4, 10)] {
        let fixture = empty_fixture();
        seed_people(&fixture, n);

        let everything = ids(&fixture.resolver.find(by_age()).await.unwrap());
        assert_eq!(everything.len(), n);

        let mut walked = Vec::new();
        let mut after: Option<String> = None;
        let mut pages = 0;
        loop {
            let mut query = by_age().first(page_size).unwrap();
            if let Some(cursor) = after.take() {
                query = query.after(cursor).unwrap();
            }
            let page = fixture.resolver.query(query).await.unwrap();
            pages += 1;
            walked.extend(ids(&page.clone().into_nodes()));

            assert_eq!(page.page_info.total_count, n);
            assert_eq!(page.page_info.has_previous_page, pages > 1);
            if !page.page_info.has_next_page {
                break;
            }
            assert_eq!(page.len() as i64, page_size);
            after = page.page_info.end_cursor.clone();
            assert!(pages <= n, "pagination did not terminate");
        }

        assert_eq!(walked, everything, "n = {}, page size = {}", n, page_size);
        let expected_pages = (n as i64 + page_size - 1) / page_size;
        assert_eq!(pages as i64, expected_pages.max(1));
    }
}

/// Walking backwards with last/before mirrors the forward walk.
#[tokio::test]
async fn test_backward_walk() {
    let fixture = empty_fixture();
    seed_people(&fixture, 5);
    let everything = ids(&fixture.resolver.find(by_age()).await.unwrap());

    let tail = fixture
        .resolver
        .query(by_age().last(2).unwrap())
        .await
        .unwrap();
    assert_eq!(ids(&tail.clone().into_nodes()), everything[3..].to_vec());
    assert!(tail.page_info.has_previous_page);
    assert!(!tail.page_info.has_next_page);

    let before = tail.page_info.start_cursor.clone().unwrap();
    let middle = fixture
        .resolver
        .query(by_age().last(2).unwrap().before(before).unwrap())
        .await
        .unwrap();
    assert_eq!(ids(&middle.into_nodes()), everything[1..3].to_vec());
}

// =============================================================================
// Sorting Tests
// =============================================================================

/// Sorting through a reference orders by the related document.
#[tokio::test]
async fn test_sort_by_related_field() {
    let fixture = seeded_fixture();
    fixture
        .library
        .seed("Book", vec![json!({"_id": "b3", "title": "Ledger", "author": "b"})])
        .unwrap();

    let books = fixture
        .resolver
        .find(
            Query::new("Book", Method::Find)
                .sort(vec![SortSpec::desc("author.name"), SortSpec::asc("title")])
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(ids(&books), vec!["b3", "b1", "b2"]);
    assert_eq!(books[0]["$author"]["name"], json!("Bob"));
}

/// Equal keys fall back to ascending id.
#[tokio::test]
async fn test_ties_break_on_id() {
    let fixture = empty_fixture();
    fixture
        .people
        .seed(
            "Person",
            vec![
                json!({"_id": "z", "name": "Same"}),
                json!({"_id": "m", "name": "Same"}),
                json!({"_id": "a", "name": "Same"}),
            ],
        )
        .unwrap();

    let found = fixture
        .resolver
        .find(
            Query::new("Person", Method::Find)
                .sort_by("name", SortDirection::Desc)
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(ids(&found), vec!["a", "m", "z"]);
}

// =============================================================================
// Classic Paging Tests
// =============================================================================

/// skip/limit slice the sorted result.
#[tokio::test]
async fn test_skip_and_limit() {
    let fixture = empty_fixture();
    seed_people(&fixture, 6);
    let everything = ids(&fixture.resolver.find(by_age()).await.unwrap());

    let page = fixture
        .resolver
        .find(by_age().skip(2).unwrap().limit(3).unwrap())
        .await
        .unwrap();

    assert_eq!(ids(&page), everything[2..5].to_vec());
}

/// The configured maximum bounds explicit page sizes only.
#[tokio::test]
async fn test_max_page_size_bounds_explicit_counts() {
    let config = ResolverConfig {
        pagination: PaginationConfig {
            max_page_size: Some(2),
        },
        ..ResolverConfig::default()
    };
    let fixture = fixture_with(config, true);
    seed_people(&fixture, 5);

    let bounded = fixture
        .resolver
        .query(by_age().first(4).unwrap())
        .await
        .unwrap();
    assert_eq!(bounded.len(), 2);
    assert!(bounded.page_info.has_next_page);

    let unbounded = fixture.resolver.find(by_age()).await.unwrap();
    assert_eq!(unbounded.len(), 5);
}

/// Count filters keep documents whose value count matches the glob.
#[tokio::test]
async fn test_count_filter() {
    let fixture = seeded_fixture();

    let two_friends = fixture
        .resolver
        .find(Query::new("Person", Method::Find).count_filter("friends", "2"))
        .await
        .unwrap();
    assert_eq!(ids(&two_friends), vec!["c"]);

    let counted = fixture
        .resolver
        .count(Query::new("Person", Method::Count).count_filter("friends", "1"))
        .await
        .unwrap();
    assert_eq!(counted, 1);
}

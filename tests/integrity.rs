//! Referential Integrity Tests
//!
//! Delete policies declared on references:
//! - restrict: delete rejected while references exist, nothing mutated
//! - cascade: referencing documents deleted in the same transaction
//! - nullify: references removed from arrays, single references set to null
//!
//! Everything a delete triggers commits or rolls back with the delete.

mod common;

use common::seeded_fixture;
use polystore::{Method, Query, ResolverError};
use serde_json::json;

fn delete(model: &str, id: &str) -> Query {
    Query::new(model, Method::Delete).id(id).unwrap()
}

// =============================================================================
// Restrict Tests
// =============================================================================

/// A referenced document cannot be deleted, and retrying changes nothing.
#[tokio::test]
async fn test_restrict_rejects_repeatedly_without_mutation() {
    let fixture = seeded_fixture();

    for _ in 0..2 {
        let err = fixture.resolver.delete(delete("Book", "b2")).await.unwrap_err();
        assert!(matches!(err, ResolverError::Restricted(_)), "{:?}", err);
        assert_eq!(err.status_code(), 409);
    }

    assert!(fixture.book("b2").is_some());
    assert_eq!(fixture.library.call_count("delete"), 0);
    assert_eq!(fixture.library.call_count("replace"), 0);
    assert_eq!(fixture.library.documents("Loan").len(), 1);
}

/// Once the reference is gone the delete goes through.
#[tokio::test]
async fn test_restrict_lifts_after_reference_removed() {
    let fixture = seeded_fixture();

    fixture.resolver.delete(delete("Loan", "l1")).await.unwrap();
    let deleted = fixture.resolver.delete(delete("Book", "b2")).await.unwrap();

    assert_eq!(deleted["id"], json!("b2"));
    assert!(fixture.book("b2").is_none());
}

/// A restrict reached through a cascade rolls the whole delete back.
#[tokio::test]
async fn test_restrict_inside_cascade_rolls_back_everything() {
    let fixture = seeded_fixture();

    let err = fixture.resolver.delete(delete("Person", "a")).await.unwrap_err();
    assert!(matches!(err, ResolverError::Restricted(_)), "{:?}", err);

    assert!(fixture.person("a").is_some());
    assert!(fixture.book("b1").is_some());
    assert!(fixture.book("b2").is_some());
    assert_eq!(fixture.person("b").unwrap()["friends"], json!(["a"]));
    assert_eq!(fixture.person("c").unwrap()["friends"], json!(["a", "b"]));
}

// =============================================================================
// Cascade and Nullify Tests
// =============================================================================

/// Deleting an author deletes their books on the other driver and removes
/// them from every friends list.
#[tokio::test]
async fn test_cascade_and_nullify_commit_together() {
    let fixture = seeded_fixture();
    fixture.resolver.delete(delete("Loan", "l1")).await.unwrap();

    fixture.resolver.delete(delete("Person", "a")).await.unwrap();

    assert!(fixture.person("a").is_none());
    assert!(fixture.library.documents("Book").is_empty());
    assert_eq!(fixture.person("b").unwrap()["friends"], json!([]));
    assert_eq!(fixture.person("c").unwrap()["friends"], json!(["b"]));
}

/// Nullify on an array reference removes just the deleted id.
#[tokio::test]
async fn test_nullify_removes_id_from_array() {
    let fixture = seeded_fixture();

    fixture.resolver.delete(delete("Person", "b")).await.unwrap();

    assert!(fixture.person("b").is_none());
    let cy = fixture.person("c").unwrap();
    assert_eq!(cy["friends"], json!(["a"]));
    assert!(cy["mentor"].is_null());
    assert_eq!(fixture.person("a").unwrap()["name"], json!("Ada"));
}

/// The next read sees the nullified document, not a cached copy.
#[tokio::test]
async fn test_integrity_writes_invalidate_cache() {
    let fixture = seeded_fixture();
    let get_cy = || Query::new("Person", Method::Get).id("c").unwrap();

    let before = fixture.resolver.get(get_cy()).await.unwrap().unwrap();
    assert_eq!(before["mentor"], json!("b"));

    fixture.resolver.delete(delete("Person", "b")).await.unwrap();

    let after = fixture.resolver.get(get_cy()).await.unwrap().unwrap();
    assert!(after["mentor"].is_null());
    assert_eq!(after["friends"], json!(["a"]));
}

/// A driver failure during a cascade rolls back the nullifications too.
#[tokio::test]
async fn test_driver_failure_during_cascade_rolls_back() {
    let fixture = seeded_fixture();
    fixture.resolver.delete(delete("Loan", "l1")).await.unwrap();
    fixture.library.fail_on("delete", Some("Book"));

    let err = fixture.resolver.delete(delete("Person", "a")).await.unwrap_err();
    assert!(matches!(err, ResolverError::Driver(_)), "{:?}", err);

    assert!(fixture.person("a").is_some());
    assert_eq!(fixture.library.documents("Book").len(), 2);
    assert_eq!(fixture.person("c").unwrap()["friends"], json!(["a", "b"]));
}

/// Deleting a document that does not exist is NotFound.
#[tokio::test]
async fn test_delete_missing_is_not_found() {
    let fixture = seeded_fixture();

    let err = fixture.resolver.delete(delete("Person", "zz")).await.unwrap_err();
    assert!(matches!(err, ResolverError::NotFound(_)));
    assert_eq!(fixture.people.call_count("delete"), 0);
}

/// Where-based deletes enforce integrity for every match.
#[tokio::test]
async fn test_delete_by_filter_cascades_each_match() {
    let fixture = seeded_fixture();
    fixture.resolver.delete(delete("Loan", "l1")).await.unwrap();

    let deleted = fixture
        .resolver
        .delete(
            Query::new("Book", Method::Delete)
                .filter(json!({"author": {"name": "Ada"}}))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(deleted.as_array().unwrap().len(), 2);
    assert!(fixture.library.documents("Book").is_empty());
    assert!(fixture.person("a").is_some());
}

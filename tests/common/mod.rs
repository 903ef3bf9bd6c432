//! Shared fixtures for the integration tests
//!
//! Two in-memory drivers: `people` holds persons, `library` holds books and
//! loans. Relations cross the two stores so joins, cascades and transactions
//! always span more than one driver.

#![allow(dead_code)]

use std::sync::Arc;

use polystore::schema::ENSURE_ID;
use polystore::{FieldDef, MemoryDriver, ModelDef, ResolverConfig, Resolver, Schema};
use serde_json::{json, Value};

pub struct Fixture {
    pub schema: Arc<Schema>,
    pub resolver: Resolver,
    pub people: Arc<MemoryDriver>,
    pub library: Arc<MemoryDriver>,
}

impl Fixture {
    /// Fresh resolver over the same drivers, with an empty cache
    pub fn resolver(&self) -> Resolver {
        Resolver::new(Arc::clone(&self.schema), ResolverConfig::default())
    }

    pub fn person(&self, id: &str) -> Option<Value> {
        find_doc(&self.people, "Person", id)
    }

    pub fn book(&self, id: &str) -> Option<Value> {
        find_doc(&self.library, "Book", id)
    }
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn find_doc(driver: &MemoryDriver, collection: &str, id: &str) -> Option<Value> {
    driver
        .documents(collection)
        .into_iter()
        .find(|doc| doc["_id"] == json!(id))
}

pub fn schema(people: Arc<MemoryDriver>, library: Arc<MemoryDriver>) -> Arc<Schema> {
    Schema::builder()
        .driver("default", people)
        .driver("library", library)
        .model(
            ModelDef::new("Person")
                .field(FieldDef::string("name").required())
                .field(FieldDef::int("age").key("years"))
                .field(
                    FieldDef::reference("friends", "Person")
                        .array()
                        .on_delete("nullify"),
                )
                .field(FieldDef::reference("mentor", "Person").on_delete("nullify"))
                .field(FieldDef::embedded("address", "Address"))
                .field(FieldDef::virtual_ref("authored", "Book", "author").array()),
        )
        .model(
            ModelDef::new("Address")
                .embedded_only()
                .field(FieldDef::string("city")),
        )
        .model(
            ModelDef::new("Book")
                .driver("library")
                .without_timestamps()
                .field(FieldDef::string("title").required())
                .field(
                    FieldDef::reference("author", "Person")
                        .on_delete("cascade")
                        .rule(ENSURE_ID),
                )
                .field(FieldDef::string("tags").array()),
        )
        .model(
            ModelDef::new("Loan")
                .driver("library")
                .without_timestamps()
                .field(FieldDef::reference("book", "Book").on_delete("restrict"))
                .field(FieldDef::string("borrower")),
        )
        .build()
        .unwrap()
}

/// Empty stores
pub fn fixture_with(config: ResolverConfig, transactional: bool) -> Fixture {
    init_test_logging();
    let (people, library) = if transactional {
        (MemoryDriver::new("people"), MemoryDriver::new("library"))
    } else {
        (
            MemoryDriver::without_transactions("people"),
            MemoryDriver::without_transactions("library"),
        )
    };
    let people = Arc::new(people);
    let library = Arc::new(library);
    let schema = schema(Arc::clone(&people), Arc::clone(&library));
    Fixture {
        resolver: Resolver::new(Arc::clone(&schema), config),
        schema,
        people,
        library,
    }
}

pub fn empty_fixture() -> Fixture {
    fixture_with(ResolverConfig::default(), true)
}

/// Ada (a) and Bob (b) are friends of Cy (c); Bob mentors Cy. Ada wrote two
/// books, one of them on loan.
pub fn seeded_fixture() -> Fixture {
    let fixture = empty_fixture();
    seed(&fixture);
    fixture
}

pub fn seed(fixture: &Fixture) {
    fixture
        .people
        .seed(
            "Person",
            vec![
                json!({"_id": "a", "name": "Ada", "years": 36, "friends": [], "address": {"city": "London"}}),
                json!({"_id": "b", "name": "Bob", "years": 41, "friends": ["a"]}),
                json!({"_id": "c", "name": "Cy", "years": 29, "friends": ["a", "b"], "mentor": "b"}),
            ],
        )
        .unwrap();
    fixture
        .library
        .seed(
            "Book",
            vec![
                json!({"_id": "b1", "title": "Notes on the Engine", "author": "a", "tags": ["math"]}),
                json!({"_id": "b2", "title": "Sketch of the Engine", "author": "a", "tags": []}),
            ],
        )
        .unwrap();
    fixture
        .library
        .seed("Loan", vec![json!({"_id": "l1", "book": "b2", "borrower": "Cy"})])
        .unwrap();
}

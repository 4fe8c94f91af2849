//! Document store collaborator
//!
//! A generic revisioned document API partitioned by namespace:
//!
//! - `create` is an atomic insert-if-absent; a second create for the same id
//!   fails with [`StoreError::AlreadyExists`]
//! - `update` and `delete` are compare-and-set on the revision; a stale
//!   revision fails with [`StoreError::Conflict`] and the caller must re-fetch
//! - `find` returns every document whose top-level fields equal the selector;
//!   [`DocumentStore::ensure_index`] makes a field cheap to select on
//!
//! [`Collection`] layers serde typing on top of the untyped trait.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod sqlite;

pub use sqlite::SqliteDocumentStore;

pub const QUERIES_TABLE: &str = "queries";
pub const ASYNC_TASKS_TABLE: &str = "async_tasks";
pub const EXECUTION_METADATA_TABLE: &str = "execution_metadata";
pub const SUBSCRIBERS_TABLE: &str = "subscribers";

/// Logical partition of the store, one per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Conductor,
    Target,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Conductor => "conductor",
            Namespace::Target => "target",
        }
    }
}

/// Errors surfaced by any [`DocumentStore`] implementation
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("revision conflict: {0}")]
    Conflict(String),

    #[error("invalid table name: {0}")]
    InvalidTable(String),

    #[error("invalid field name: {0}")]
    InvalidField(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Untyped stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub rev: i64,
    pub body: serde_json::Value,
}

/// Equality selector over top-level document fields.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    fields: Vec<(String, serde_json::Value)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Serialize) -> Result<Self, StoreError> {
        let value = serde_json::to_value(value)?;
        self.fields.push((field.into(), value));
        Ok(self)
    }

    pub fn fields(&self) -> &[(String, serde_json::Value)] {
        &self.fields
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ensure_table(&self, ns: Namespace, table: &str) -> Result<(), StoreError>;

    /// Index a top-level field so `find` on it does not scan the table.
    async fn ensure_index(&self, ns: Namespace, table: &str, field: &str)
        -> Result<(), StoreError>;

    /// Insert-if-absent. Returns the initial revision.
    async fn create(
        &self,
        ns: Namespace,
        table: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<i64, StoreError>;

    async fn get(&self, ns: Namespace, table: &str, id: &str) -> Result<RawDocument, StoreError>;

    /// Compare-and-set on `rev`. Returns the new revision.
    async fn update(
        &self,
        ns: Namespace,
        table: &str,
        id: &str,
        rev: i64,
        body: serde_json::Value,
    ) -> Result<i64, StoreError>;

    async fn delete(&self, ns: Namespace, table: &str, id: &str, rev: i64)
        -> Result<(), StoreError>;

    async fn find(
        &self,
        ns: Namespace,
        table: &str,
        selector: &Selector,
    ) -> Result<Vec<RawDocument>, StoreError>;
}

/// A typed document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub id: String,
    pub rev: i64,
    pub doc: T,
}

/// Typed view over one `(namespace, table)`.
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    ns: Namespace,
    table: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ns: self.ns,
            table: self.table,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    pub fn new(store: Arc<dyn DocumentStore>, ns: Namespace, table: &'static str) -> Self {
        Self {
            store,
            ns,
            table,
            _marker: PhantomData,
        }
    }

    pub async fn create(&self, id: &str, doc: T) -> Result<Versioned<T>, StoreError> {
        let body = serde_json::to_value(&doc)?;
        let rev = self.store.create(self.ns, self.table, id, body).await?;
        Ok(Versioned {
            id: id.to_string(),
            rev,
            doc,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Versioned<T>, StoreError> {
        let raw = self.store.get(self.ns, self.table, id).await?;
        decode(raw)
    }

    /// Writes `doc.doc` over the revision it was read at and bumps `doc.rev`.
    pub async fn update(&self, doc: &mut Versioned<T>) -> Result<(), StoreError> {
        let body = serde_json::to_value(&doc.doc)?;
        doc.rev = self
            .store
            .update(self.ns, self.table, &doc.id, doc.rev, body)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, doc: Versioned<T>) -> Result<(), StoreError> {
        self.store
            .delete(self.ns, self.table, &doc.id, doc.rev)
            .await
    }

    pub async fn find(&self, selector: &Selector) -> Result<Vec<Versioned<T>>, StoreError> {
        self.store
            .find(self.ns, self.table, selector)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }
}

fn decode<T: DeserializeOwned>(raw: RawDocument) -> Result<Versioned<T>, StoreError> {
    Ok(Versioned {
        id: raw.id,
        rev: raw.rev,
        doc: serde_json::from_value(raw.body)?,
    })
}

/// Create every table the hosted roles use.
pub async fn bootstrap(store: &dyn DocumentStore) -> Result<(), StoreError> {
    store.ensure_table(Namespace::Conductor, QUERIES_TABLE).await?;
    store
        .ensure_table(Namespace::Conductor, ASYNC_TASKS_TABLE)
        .await?;
    store
        .ensure_table(Namespace::Conductor, EXECUTION_METADATA_TABLE)
        .await?;
    store.ensure_table(Namespace::Target, SUBSCRIBERS_TABLE).await?;

    store
        .ensure_index(Namespace::Conductor, ASYNC_TASKS_TABLE, "query_id")
        .await?;
    store
        .ensure_index(Namespace::Target, SUBSCRIBERS_TABLE, "concept")
        .await?;
    Ok(())
}

// Document and user records.
//
// The relay never creates documents; it reads the ownership/access flags
// written by the notes service and records where a document's CRDT state
// lives the first time that state is persisted.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};

pub type UserId = i64;

pub type RecordFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: String,
    pub owner_id: UserId,
    pub read_only: bool,
    /// Set once, the first time the document's state is persisted.
    pub storage_key: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, owner_id: UserId) -> Self {
        Self { id: id.into(), owner_id, read_only: false, storage_key: None, deleted_at: None }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKeyWrite {
    /// The key was written by this call.
    Recorded,
    /// Another writer got there first; its key wins.
    AlreadySet { existing: String },
}

pub trait DocumentRecordStore: Send + Sync {
    /// Looks up a document by id. Soft-deleted records are returned with
    /// `deleted_at` set so callers can tell them apart from missing ones.
    fn find_by_id<'a>(&'a self, document_id: &'a str) -> RecordFuture<'a, Option<DocumentRecord>>;

    fn find_user<'a>(&'a self, user_id: UserId) -> RecordFuture<'a, Option<UserRecord>>;

    /// Records the storage key only if none is set yet.
    fn set_storage_key<'a>(
        &'a self,
        document_id: &'a str,
        storage_key: &'a str,
    ) -> RecordFuture<'a, StorageKeyWrite>;
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    user_id: i64,
    read_only: bool,
    state_storage_key: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<DocumentRow> for DocumentRecord {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.user_id,
            read_only: row.read_only,
            storage_key: row.state_storage_key,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    email: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StorageKeyRow {
    state_storage_key: Option<String>,
}

impl DocumentRecordStore for PgRecordStore {
    fn find_by_id<'a>(&'a self, document_id: &'a str) -> RecordFuture<'a, Option<DocumentRecord>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, DocumentRow>(
                "
                SELECT id, user_id, read_only, state_storage_key, deleted_at
                FROM documents
                WHERE id = $1
                ",
            )
            .bind(document_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "find_document_by_id"))
            .await
            .with_context(|| format!("failed to load document record {document_id}"))?;

            Ok(row.map(DocumentRecord::from))
        })
    }

    fn find_user<'a>(&'a self, user_id: UserId) -> RecordFuture<'a, Option<UserRecord>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, UserRow>(
                "
                SELECT id, name, email
                FROM users
                WHERE id = $1
                ",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "find_user_by_id"))
            .await
            .with_context(|| format!("failed to load user record {user_id}"))?;

            Ok(row.map(|row| UserRecord { id: row.id, name: row.name, email: row.email }))
        })
    }

    fn set_storage_key<'a>(
        &'a self,
        document_id: &'a str,
        storage_key: &'a str,
    ) -> RecordFuture<'a, StorageKeyWrite> {
        Box::pin(async move {
            let written = sqlx::query(
                "
                UPDATE documents
                SET state_storage_key = $2, updated_at = now()
                WHERE id = $1
                  AND state_storage_key IS NULL
                ",
            )
            .bind(document_id)
            .bind(storage_key)
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "set_document_storage_key"))
            .await
            .with_context(|| format!("failed to record storage key for document {document_id}"))?
            .rows_affected();

            if written == 1 {
                return Ok(StorageKeyWrite::Recorded);
            }

            let row = sqlx::query_as::<_, StorageKeyRow>(
                "
                SELECT state_storage_key
                FROM documents
                WHERE id = $1
                ",
            )
            .bind(document_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "fetch_document_storage_key"))
            .await
            .with_context(|| format!("failed to re-read storage key for document {document_id}"))?
            .ok_or_else(|| anyhow!("document {document_id} does not exist"))?;

            let existing = row.state_storage_key.ok_or_else(|| {
                anyhow!("storage key for document {document_id} was neither written nor present")
            })?;

            Ok(StorageKeyWrite::AlreadySet { existing })
        })
    }
}

/// Record store backed by process memory, used by tests and local tooling.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<MemoryRecords>>,
}

#[derive(Default)]
struct MemoryRecords {
    documents: HashMap<String, DocumentRecord>,
    users: HashMap<UserId, UserRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserRecord) {
        self.inner.write().await.users.insert(user.id, user);
    }

    pub async fn insert_document(&self, document: DocumentRecord) {
        self.inner.write().await.documents.insert(document.id.clone(), document);
    }

    pub async fn document(&self, document_id: &str) -> Option<DocumentRecord> {
        self.inner.read().await.documents.get(document_id).cloned()
    }
}

impl DocumentRecordStore for MemoryRecordStore {
    fn find_by_id<'a>(&'a self, document_id: &'a str) -> RecordFuture<'a, Option<DocumentRecord>> {
        Box::pin(async move { Ok(self.document(document_id).await) })
    }

    fn find_user<'a>(&'a self, user_id: UserId) -> RecordFuture<'a, Option<UserRecord>> {
        Box::pin(async move { Ok(self.inner.read().await.users.get(&user_id).cloned()) })
    }

    fn set_storage_key<'a>(
        &'a self,
        document_id: &'a str,
        storage_key: &'a str,
    ) -> RecordFuture<'a, StorageKeyWrite> {
        Box::pin(async move {
            let mut records = self.inner.write().await;
            let document = records
                .documents
                .get_mut(document_id)
                .ok_or_else(|| anyhow!("document {document_id} does not exist"))?;

            match &document.storage_key {
                Some(existing) => Ok(StorageKeyWrite::AlreadySet { existing: existing.clone() }),
                None => {
                    document.storage_key = Some(storage_key.to_owned());
                    Ok(StorageKeyWrite::Recorded)
                }
            }
        })
    }
}

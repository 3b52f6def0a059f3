//! Transactional upserts of item records into a document store.
//!
//! The store is organised as one database per region and one collection per resolved
//! partition. Every collection touched by a batch gets its own transaction: either all
//! of the batch's records for that collection are replaced or none are.
//!
//! `MongoStore` is the production backend. `FilesystemStore` keeps the same layout in
//! JSON files for single-host deployments, and `MemoryStore` backs tests.

use crate::extractor::PartitionResult;
use crate::metrics_defs::{STORE_COMMIT_FAILED, STORE_RECORDS_UPSERTED};
use crate::types::{ItemId, ItemRecord};
use async_trait::async_trait;
use indexmap::IndexMap;
use mongodb::bson::doc;
use mongodb::{ClientSession, Collection};
use parking_lot::RwLock;
use shared::counter;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Database and collection a document lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new<D, C>(database: D, collection: C) -> Self
    where
        D: Into<String>,
        C: Into<String>,
    {
        Namespace {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// A partition result tagged with the region that owns it.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionResult {
    pub region_name: String,
    pub partition: PartitionResult,
}

impl RegionResult {
    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.region_name, &self.partition.partition_name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreFailure {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("document codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("document database error: {0}")]
    Database(#[from] mongodb::error::Error),
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

#[derive(thiserror::Error, Debug)]
#[error("upsert into {collection} failed: {cause}")]
pub struct StoreError {
    pub collection: Namespace,
    #[source]
    pub cause: StoreFailure,
}

/// Backend seam for the document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Opens a transaction scoped to a single collection.
    async fn begin(&self, namespace: &Namespace) -> Result<Box<dyn Transaction>, StoreFailure>;

    /// Every committed document in the collection, ordered by id.
    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<ItemRecord>, StoreFailure>;
}

/// Writes staged against one collection. Dropping a transaction without committing
/// discards everything staged in it.
#[async_trait]
pub trait Transaction: Send {
    /// Stages an insert-or-replace of `record`, keyed by its id.
    async fn upsert(&mut self, record: &ItemRecord) -> Result<(), StoreFailure>;

    async fn commit(self: Box<Self>) -> Result<(), StoreFailure>;

    async fn abort(self: Box<Self>);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertSummary {
    pub collections: usize,
    pub records: usize,
}

#[derive(Clone)]
pub struct MarketStore {
    backend: Arc<dyn DocumentStore>,
}

impl MarketStore {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        MarketStore { backend }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.backend
    }

    /// Upserts every record of every result, one transaction per collection.
    ///
    /// Collections are committed in the order they first appear in `results`. The
    /// first failing collection is aborted and returned as the error; collections
    /// committed before it stay committed and later ones are not attempted.
    pub async fn upsert_all(&self, results: &[RegionResult]) -> Result<UpsertSummary, StoreError> {
        let mut grouped: IndexMap<Namespace, Vec<&ItemRecord>> = IndexMap::new();
        for result in results {
            grouped
                .entry(result.namespace())
                .or_default()
                .extend(result.partition.records.iter());
        }

        let mut summary = UpsertSummary::default();

        for (namespace, records) in grouped {
            if let Err(cause) = self.commit_collection(&namespace, &records).await {
                counter!(STORE_COMMIT_FAILED).increment(1);
                return Err(StoreError {
                    collection: namespace,
                    cause,
                });
            }

            counter!(STORE_RECORDS_UPSERTED).increment(records.len() as u64);
            tracing::info!(
                collection = %namespace,
                records = records.len(),
                "Upserted items"
            );

            summary.collections += 1;
            summary.records += records.len();
        }

        Ok(summary)
    }

    async fn commit_collection(
        &self,
        namespace: &Namespace,
        records: &[&ItemRecord],
    ) -> Result<(), StoreFailure> {
        let mut txn = self.backend.begin(namespace).await?;

        for record in records {
            if let Err(e) = txn.upsert(record).await {
                txn.abort().await;
                return Err(e);
            }
        }

        txn.commit().await
    }
}

type Collections = HashMap<Namespace, BTreeMap<ItemId, ItemRecord>>;

/// Process-local document store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<Namespace> = self.data.read().keys().cloned().collect();
        namespaces.sort();
        namespaces
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn begin(&self, namespace: &Namespace) -> Result<Box<dyn Transaction>, StoreFailure> {
        Ok(Box::new(MemoryTransaction {
            namespace: namespace.clone(),
            staged: Vec::new(),
            data: self.data.clone(),
        }))
    }

    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<ItemRecord>, StoreFailure> {
        Ok(self
            .data
            .read()
            .get(namespace)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }
}

struct MemoryTransaction {
    namespace: Namespace,
    staged: Vec<ItemRecord>,
    data: Arc<RwLock<Collections>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn upsert(&mut self, record: &ItemRecord) -> Result<(), StoreFailure> {
        self.staged.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreFailure> {
        let MemoryTransaction {
            namespace,
            staged,
            data,
        } = *self;

        let mut guard = data.write();
        let documents = guard.entry(namespace).or_default();
        for record in staged {
            documents.insert(record.id.clone(), record);
        }

        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

/// Stores each collection as a JSON array of documents at `base_dir/<database>/<collection>.json`.
///
/// A commit rewrites the collection file through a temporary file and a rename, so a
/// reader never observes a half-applied batch.
#[derive(Clone)]
pub struct FilesystemStore {
    base_dir: PathBuf,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FilesystemStore {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        FilesystemStore {
            base_dir: base_dir.into(),
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn collection_path(&self, namespace: &Namespace) -> Result<PathBuf, StoreFailure> {
        validate_name(&namespace.database)?;
        validate_name(&namespace.collection)?;

        Ok(self
            .base_dir
            .join(&namespace.database)
            .join(format!("{}.json", namespace.collection)))
    }
}

fn validate_name(name: &str) -> Result<(), StoreFailure> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(StoreFailure::InvalidName(name.to_string()));
    }
    Ok(())
}

async fn read_collection(path: &Path) -> Result<BTreeMap<ItemId, ItemRecord>, StoreFailure> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let documents: Vec<ItemRecord> = serde_json::from_slice(&bytes)?;
    Ok(documents
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect())
}

#[async_trait]
impl DocumentStore for FilesystemStore {
    async fn begin(&self, namespace: &Namespace) -> Result<Box<dyn Transaction>, StoreFailure> {
        let path = self.collection_path(namespace)?;

        Ok(Box::new(FilesystemTransaction {
            path,
            staged: Vec::new(),
            commit_lock: self.commit_lock.clone(),
        }))
    }

    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<ItemRecord>, StoreFailure> {
        let path = self.collection_path(namespace)?;
        Ok(read_collection(&path).await?.into_values().collect())
    }
}

struct FilesystemTransaction {
    path: PathBuf,
    staged: Vec<ItemRecord>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl Transaction for FilesystemTransaction {
    async fn upsert(&mut self, record: &ItemRecord) -> Result<(), StoreFailure> {
        self.staged.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreFailure> {
        let FilesystemTransaction {
            path,
            staged,
            commit_lock,
        } = *self;
        let _guard = commit_lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut documents = read_collection(&path).await?;
        for record in staged {
            documents.insert(record.id.clone(), record);
        }

        let encoded = serde_json::to_vec_pretty(&documents.values().collect::<Vec<_>>())?;
        replace_file(&path, &encoded).await?;

        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

/// Writes `contents` next to `path` and renames it into place. The temporary file is
/// removed again if either step fails.
async fn replace_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    let result = async {
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %tmp_path.display(),
                    error = %e,
                    "Could not remove temporary file"
                );
            }
        }
    }

    result
}

/// Document database backend. A transaction is a client session scoped to one
/// collection; records are replaced by `id` with upsert semantics.
#[derive(Clone)]
pub struct MongoStore {
    client: mongodb::Client,
}

impl MongoStore {
    /// Parses the connection string and sets up the connection pool. Servers are only
    /// contacted once the first operation runs.
    pub async fn connect(connection_string: &str) -> Result<Self, StoreFailure> {
        let client = mongodb::Client::with_uri_str(connection_string).await?;
        Ok(MongoStore { client })
    }

    fn collection(&self, namespace: &Namespace) -> Result<Collection<ItemRecord>, StoreFailure> {
        validate_database_name(&namespace.database)?;
        validate_collection_name(&namespace.collection)?;

        Ok(self
            .client
            .database(&namespace.database)
            .collection(&namespace.collection))
    }
}

fn validate_database_name(name: &str) -> Result<(), StoreFailure> {
    let invalid = name.is_empty()
        || name.len() >= 64
        || name.contains(['/', '\\', '.', ' ', '"', '$', '\0']);

    if invalid {
        return Err(StoreFailure::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_collection_name(name: &str) -> Result<(), StoreFailure> {
    let invalid = name.is_empty() || name.starts_with("system.") || name.contains(['$', '\0']);

    if invalid {
        return Err(StoreFailure::InvalidName(name.to_string()));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn begin(&self, namespace: &Namespace) -> Result<Box<dyn Transaction>, StoreFailure> {
        let collection = self.collection(namespace)?;

        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        Ok(Box::new(MongoTransaction {
            collection,
            session,
        }))
    }

    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<ItemRecord>, StoreFailure> {
        let mut cursor = self
            .collection(namespace)?
            .find(doc! {})
            .sort(doc! { "id": 1 })
            .await?;

        let mut records = Vec::new();
        while cursor.advance().await? {
            records.push(cursor.deserialize_current()?);
        }
        Ok(records)
    }
}

struct MongoTransaction {
    collection: Collection<ItemRecord>,
    session: ClientSession,
}

#[async_trait]
impl Transaction for MongoTransaction {
    async fn upsert(&mut self, record: &ItemRecord) -> Result<(), StoreFailure> {
        self.collection
            .replace_one(doc! { "id": record.id.as_str() }, record)
            .upsert(true)
            .session(&mut self.session)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreFailure> {
        let mut txn = *self;
        txn.session.commit_transaction().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let mut txn = *self;
        if let Err(e) = txn.session.abort_transaction().await {
            tracing::warn!(
                collection = %txn.collection.namespace(),
                error = %e,
                "Failed to abort transaction"
            );
        }
    }
}

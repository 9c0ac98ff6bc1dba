//! Catalog functionality that is preserved in the object store.
//!
//! The catalog is an append-only log of transactions. Each transaction is one object store
//! file that lists the artifacts it adds and removes; the live set is obtained by replaying
//! all transactions in revision order. A transaction becomes visible with the single PUT of
//! its file, so after a crash it is either fully present or absent.
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    interface::{ArtifactInfo, CatalogState, CatalogStateAddError, CatalogStateRemoveError},
    internals::serialize::{
        self, TRANSACTION_FILE_TYPE, serialize_to_file_bytes, verify_file_type_and_deserialize,
    },
    paths::{ArtifactPath, CatalogPrefix, TransactionFilePath},
};

/// Current version for serialized transactions.
pub const TRANSACTION_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error during (de)serialization: {0}")]
    Serialization(#[from] serialize::Error),

    #[error("error during store write operation: {source}")]
    Write { source: object_store::Error },

    #[error("error during store read operation: {source}")]
    Read { source: object_store::Error },

    #[error("missing transaction: {revision_counter}")]
    MissingTransaction { revision_counter: u64 },

    #[error("wrong revision counter in transaction file: expected {expected} but found {actual}")]
    WrongTransactionRevision { actual: u64, expected: u64 },

    #[error(
        "wrong UUID for transaction file (revision {revision_counter}): expected {expected} but found {actual}"
    )]
    WrongTransactionUuid {
        revision_counter: u64,
        expected: Uuid,
        actual: Uuid,
    },

    #[error(
        "wrong link to previous UUID in revision {revision_counter}: expected {expected:?} but found {actual:?}"
    )]
    WrongTransactionLink {
        revision_counter: u64,
        expected: Option<Uuid>,
        actual: Option<Uuid>,
    },

    #[error(
        "format version of transaction file for revision {revision_counter} is {actual} but only {expected} is supported"
    )]
    TransactionVersionMismatch {
        revision_counter: u64,
        actual: u32,
        expected: u32,
    },

    #[error(
        "fork detected. Revision {revision_counter} has two UUIDs {uuid1} and {uuid2}. Maybe two writer instances were running in parallel?"
    )]
    Fork {
        revision_counter: u64,
        uuid1: Uuid,
        uuid2: Uuid,
    },

    #[error("revision {revision_counter} was already committed by another writer")]
    TransactionAlreadyExists { revision_counter: u64 },

    #[error(transparent)]
    Add(#[from] CatalogStateAddError),

    #[error(transparent)]
    Remove(#[from] CatalogStateRemoveError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Key to address transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransactionKey {
    revision_counter: u64,
    uuid: Uuid,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.revision_counter, self.uuid)
    }
}

/// A single action within a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Action {
    AddArtifact(ArtifactInfo),
    RemoveArtifact { path: ArtifactPath },
}

/// On-disk form of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TransactionRecord {
    version: u32,
    revision_counter: u64,
    uuid: Uuid,
    previous_uuid: Option<Uuid>,
    start_timestamp: DateTime<Utc>,
    actions: Vec<Action>,
}

impl TransactionRecord {
    fn tkey(&self) -> TransactionKey {
        TransactionKey {
            revision_counter: self.revision_counter,
            uuid: self.uuid,
        }
    }
}

/// Inner mutable part of the preserved catalog.
#[derive(Debug)]
struct PreservedCatalogInner<S> {
    previous_tkey: Option<TransactionKey>,
    state: Arc<S>,
}

/// In-memory view of the preserved catalog.
pub struct PreservedCatalog<S>
where
    S: CatalogState,
{
    // We need an RWLock AND a semaphore, so that readers are NOT blocked during an open transactions. Note that this
    // requires a new transaction to:
    //
    // 1. acquire the semaphore
    // 2. clone the committed state under a read lock to get a transaction-local state
    // 3. perform all transaction edits (e.g. adding artifacts)
    // 4. write the transaction file
    // 5. get a writer lock and swap transaction-local state w/ global state
    // 6. release semaphore
    //
    // Note that there can only be a single transaction that acquires the semaphore.
    inner: RwLock<PreservedCatalogInner<S>>,
    transaction_semaphore: Semaphore,

    object_store: Arc<dyn ObjectStore>,
    prefix: CatalogPrefix,
}

impl<S> PreservedCatalog<S>
where
    S: CatalogState,
{
    /// Create new catalog w/o any data.
    ///
    /// Nothing is written until the first transaction commits.
    pub fn new_empty(
        object_store: Arc<dyn ObjectStore>,
        prefix: CatalogPrefix,
        state_data: S::EmptyInput,
    ) -> Self {
        Self::new_inner(object_store, prefix, None, S::new_empty(state_data))
    }

    fn new_inner(
        object_store: Arc<dyn ObjectStore>,
        prefix: CatalogPrefix,
        previous_tkey: Option<TransactionKey>,
        state: S,
    ) -> Self {
        Self {
            inner: RwLock::new(PreservedCatalogInner {
                previous_tkey,
                state: Arc::new(state),
            }),
            transaction_semaphore: Semaphore::new(1),
            object_store,
            prefix,
        }
    }

    /// Load existing catalog from store, if it exists.
    ///
    /// Replays all transactions in revision order and checks that they form a single chain.
    pub async fn load(
        object_store: Arc<dyn ObjectStore>,
        prefix: CatalogPrefix,
        state_data: S::EmptyInput,
    ) -> Result<Option<Self>> {
        // parse all paths into revisions
        let list_path = prefix.transactions_dir();
        let listed = object_store
            .list(Some(&list_path))
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| Error::Read { source })?;

        let mut transactions: HashMap<u64, Uuid> = HashMap::new();
        for meta in listed {
            let Some((revision_counter, uuid)) = TransactionFilePath::parse(&prefix, &meta.location)
            else {
                debug!(path=%meta.location, "ignoring foreign file in transaction directory");
                continue;
            };

            // insert but check for duplicates
            match transactions.entry(revision_counter) {
                Entry::Occupied(o) => {
                    // sort for determinism
                    let (uuid1, uuid2) = if *o.get() < uuid {
                        (*o.get(), uuid)
                    } else {
                        (uuid, *o.get())
                    };

                    return Err(Error::Fork {
                        revision_counter,
                        uuid1,
                        uuid2,
                    });
                }
                Entry::Vacant(v) => {
                    v.insert(uuid);
                }
            }
        }

        // Check if there is any catalog stored at all
        let Some(max_revision) = transactions.keys().max().copied() else {
            release_dangling_claim(object_store.as_ref(), &prefix, 0).await?;
            return Ok(None);
        };

        // read and replay revisions
        let mut state = S::new_empty(state_data);
        let mut last_tkey = None;
        for revision_counter in 0..=max_revision {
            let uuid = *transactions
                .get(&revision_counter)
                .ok_or(Error::MissingTransaction { revision_counter })?;
            let tkey = TransactionKey {
                revision_counter,
                uuid,
            };

            let record = load_transaction(&object_store, &prefix, &tkey, last_tkey).await?;
            for action in &record.actions {
                apply_action(&mut state, action)?;
            }
            debug!(%tkey, n_actions = record.actions.len(), "replayed transaction");

            last_tkey = Some(tkey);
        }

        release_dangling_claim(object_store.as_ref(), &prefix, max_revision + 1).await?;

        info!(%prefix, revisions = max_revision + 1, "preserved catalog loaded");

        Ok(Some(Self::new_inner(object_store, prefix, last_tkey, state)))
    }

    /// Open a new transaction.
    ///
    /// Note that only a single transaction can be open at any time. This call will `await` until any outstanding
    /// transaction handle is dropped. The newly created transaction will contain the state after `await` (esp.
    /// post-blocking). This system is fair, which means that transactions are given out in the order they were
    /// requested.
    pub async fn open_transaction(&self) -> TransactionHandle<'_, S> {
        TransactionHandle::new(self).await
    }

    /// Return current state.
    pub fn state(&self) -> Arc<S> {
        Arc::clone(&self.inner.read().state)
    }

    /// Get latest revision counter.
    ///
    /// This can be `None` for a newly created catalog.
    pub fn revision_counter(&self) -> Option<u64> {
        self.inner
            .read()
            .previous_tkey
            .map(|tkey| tkey.revision_counter)
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    pub fn prefix(&self) -> &CatalogPrefix {
        &self.prefix
    }
}

impl<S> fmt::Debug for PreservedCatalog<S>
where
    S: CatalogState,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreservedCatalog")
            .field("prefix", &self.prefix)
            .field("revision_counter", &self.revision_counter())
            .finish_non_exhaustive()
    }
}

fn apply_action<S: CatalogState>(state: &mut S, action: &Action) -> Result<()> {
    match action {
        Action::AddArtifact(info) => state.add(info.clone())?,
        Action::RemoveArtifact { path } => state.remove(path)?,
    }
    Ok(())
}

/// Remove the claim on `revision_counter` if one exists.
///
/// Called on load for the first revision without a record: a claim there belongs to a writer
/// that died after claiming the revision but before storing its record.
async fn release_dangling_claim(
    object_store: &dyn ObjectStore,
    prefix: &CatalogPrefix,
    revision_counter: u64,
) -> Result<()> {
    let claim = prefix.revision_claim(revision_counter);
    match object_store.head(&claim).await {
        Ok(_) => {
            warn!(revision_counter, "releasing claim of uncommitted transaction");
            object_store
                .delete(&claim)
                .await
                .map_err(|source| Error::Write { source })
        }
        Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(source) => Err(Error::Read { source }),
    }
}

/// Load a transaction file and sanity-check it against the key it was listed under.
async fn load_transaction(
    object_store: &Arc<dyn ObjectStore>,
    prefix: &CatalogPrefix,
    tkey: &TransactionKey,
    last_tkey: Option<TransactionKey>,
) -> Result<TransactionRecord> {
    let path = TransactionFilePath::new(prefix, tkey.revision_counter, tkey.uuid);
    let bytes = object_store
        .get(&path)
        .await
        .map_err(|source| Error::Read { source })?
        .bytes()
        .await
        .map_err(|source| Error::Read { source })?;
    let record: TransactionRecord = verify_file_type_and_deserialize(TRANSACTION_FILE_TYPE, bytes)?;

    if record.version != TRANSACTION_VERSION {
        return Err(Error::TransactionVersionMismatch {
            revision_counter: tkey.revision_counter,
            actual: record.version,
            // we only support a single version right now
            expected: TRANSACTION_VERSION,
        });
    }
    if record.revision_counter != tkey.revision_counter {
        return Err(Error::WrongTransactionRevision {
            actual: record.revision_counter,
            expected: tkey.revision_counter,
        });
    }
    if record.uuid != tkey.uuid {
        return Err(Error::WrongTransactionUuid {
            revision_counter: tkey.revision_counter,
            expected: tkey.uuid,
            actual: record.uuid,
        });
    }
    let expected_link = last_tkey.map(|tkey| tkey.uuid);
    if record.previous_uuid != expected_link {
        return Err(Error::WrongTransactionLink {
            revision_counter: tkey.revision_counter,
            expected: expected_link,
            actual: record.previous_uuid,
        });
    }

    Ok(record)
}

/// Tracker for an open, uncommitted transaction.
#[derive(Debug)]
struct OpenTransaction<S> {
    next_state: S,
    record: TransactionRecord,
}

impl<S> OpenTransaction<S>
where
    S: CatalogState,
{
    fn new(catalog_inner: &PreservedCatalogInner<S>) -> Self {
        let (revision_counter, previous_uuid) = match &catalog_inner.previous_tkey {
            Some(tkey) => (tkey.revision_counter + 1, Some(tkey.uuid)),
            None => (0, None),
        };

        Self {
            next_state: catalog_inner.state.as_ref().clone(),
            record: TransactionRecord {
                version: TRANSACTION_VERSION,
                revision_counter,
                uuid: Uuid::new_v4(),
                previous_uuid,
                start_timestamp: Utc::now(),
                actions: vec![],
            },
        }
    }

    /// Apply `action` to the transaction-local state and record it.
    ///
    /// A failing action leaves the transaction untouched.
    fn handle_action_and_record(&mut self, action: Action) -> Result<()> {
        apply_action(&mut self.next_state, &action)?;
        self.record.actions.push(action);
        Ok(())
    }

    async fn store(&self, object_store: &dyn ObjectStore, prefix: &CatalogPrefix) -> Result<()> {
        let tkey = self.record.tkey();
        let data = serialize_to_file_bytes(TRANSACTION_FILE_TYPE, &self.record)?;

        // claim the revision first, a concurrent writer for the same revision must lose
        let claim = prefix.revision_claim(tkey.revision_counter);
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match object_store
            .put_opts(&claim, PutPayload::from(tkey.uuid.to_string()), opts)
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                return Err(Error::TransactionAlreadyExists {
                    revision_counter: tkey.revision_counter,
                });
            }
            Err(source) => return Err(Error::Write { source }),
        }

        let path = TransactionFilePath::new(prefix, tkey.revision_counter, tkey.uuid);
        if let Err(source) = object_store.put(&path, PutPayload::from_bytes(data)).await {
            // the record was never written, so the revision is free again
            if let Err(e) = object_store.delete(&claim).await {
                warn!(%tkey, %e, "failed to release revision claim");
            }
            return Err(Error::Write { source });
        }

        Ok(())
    }
}

/// Handle for an open uncommitted transaction.
///
/// Staged actions are validated against the transaction-local state right away, but only
/// become durable and visible to readers with [`commit`](Self::commit).
///
/// Dropping this object w/o calling [`commit`](Self::commit) or [`abort`](Self::abort) will
/// issue a warning.
pub struct TransactionHandle<'c, S>
where
    S: CatalogState,
{
    catalog: &'c PreservedCatalog<S>,

    // NOTE: The permit is technically used since we use it to reference the semaphore. It implements `drop` which we
    //       rely on.
    _permit: SemaphorePermit<'c>,

    transaction: Option<OpenTransaction<S>>,
}

impl<'c, S> TransactionHandle<'c, S>
where
    S: CatalogState,
{
    async fn new(catalog: &'c PreservedCatalog<S>) -> Self {
        // first acquire semaphore (which is only being used for transactions), then get state lock
        let permit = catalog
            .transaction_semaphore
            .acquire()
            .await
            .expect("semaphore should not be closed");

        let transaction = OpenTransaction::new(&catalog.inner.read());
        info!(tkey=%transaction.record.tkey(), "transaction started");

        Self {
            catalog,
            _permit: permit,
            transaction: Some(transaction),
        }
    }

    fn open(&mut self) -> &mut OpenTransaction<S> {
        self.transaction
            .as_mut()
            .expect("transaction handle w/o transaction?!")
    }

    /// Revision this transaction will have once committed
    pub fn revision_counter(&self) -> u64 {
        self.transaction
            .as_ref()
            .map(|t| t.record.revision_counter)
            .unwrap_or_default()
    }

    /// Record a newly written artifact.
    ///
    /// If an artifact with the same path is already live an error will be returned.
    pub fn stage_add(&mut self, info: ArtifactInfo) -> Result<()> {
        self.open().handle_action_and_record(Action::AddArtifact(info))
    }

    /// Mark an artifact as no longer live.
    ///
    /// The artifact is not deleted; it stays readable until the cleanup sweep finds it
    /// unreferenced. Removing artifacts that are not live results in an error.
    pub fn stage_remove(&mut self, path: &ArtifactPath) -> Result<()> {
        self.open()
            .handle_action_and_record(Action::RemoveArtifact { path: path.clone() })
    }

    /// Write the transaction to object store and commit it to the in-memory state.
    ///
    /// Returns the revision counter of the committed transaction. On error nothing was
    /// applied and the transaction is gone.
    pub async fn commit(mut self) -> Result<u64> {
        let t = self
            .transaction
            .take()
            .expect("calling .commit on a closed transaction?!");
        let tkey = t.record.tkey();

        // write to object store
        if let Err(e) = t
            .store(self.catalog.object_store.as_ref(), &self.catalog.prefix)
            .await
        {
            warn!(%tkey, %e, "failed to store transaction");
            return Err(e);
        }

        // commit to catalog
        let n_actions = t.record.actions.len();
        let mut inner_guard = self.catalog.inner.write();
        inner_guard.state = Arc::new(t.next_state);
        inner_guard.previous_tkey = Some(tkey);
        drop(inner_guard);

        info!(%tkey, n_actions, "transaction committed");

        Ok(tkey.revision_counter)
    }

    /// Discard all staged actions. Nothing is written.
    pub fn abort(mut self) {
        if let Some(t) = self.transaction.take() {
            info!(tkey=%t.record.tkey(), n_actions=t.record.actions.len(), "transaction aborted");
        }
    }
}

impl<'c, S> fmt::Debug for TransactionHandle<'c, S>
where
    S: CatalogState,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transaction {
            Some(t) => write!(f, "TransactionHandle(open, {})", t.record.tkey()),
            None => write!(f, "TransactionHandle(closed)"),
        }
    }
}

impl<'c, S> Drop for TransactionHandle<'c, S>
where
    S: CatalogState,
{
    fn drop(&mut self) {
        if self.transaction.is_some() {
            warn!(?self, "dropped uncommitted transaction");
        }
    }
}

//! Object store layout of a preserved catalog.
//!
//! ```text
//! <prefix>/transactions/<revision_counter:020>/<uuid>.txn
//! <prefix>/revisions/<revision_counter:020>
//! <prefix>/data/<table>/<partition>/<chunk_id>.<uuid>.chunk
//! ```
use std::{fmt, ops::Deref};

use data_types::chunk_metadata::ChunkAddr;
use object_store::path::Path as ObjPath;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File extension for transaction files
pub const TRANSACTION_FILE_EXTENSION: &str = "txn";

/// File extension for chunk artifacts
pub const ARTIFACT_FILE_EXTENSION: &str = "chunk";

/// Root directory of one preserved catalog and its artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPrefix(ObjPath);

impl CatalogPrefix {
    pub fn new(prefix: &str) -> Self {
        Self(ObjPath::from(prefix))
    }

    pub fn transactions_dir(&self) -> ObjPath {
        self.0.child("transactions")
    }

    pub fn data_dir(&self) -> ObjPath {
        self.0.child("data")
    }

    pub fn revisions_dir(&self) -> ObjPath {
        self.0.child("revisions")
    }

    /// Marker that is created exclusively by the single writer of `revision_counter`.
    pub fn revision_claim(&self, revision_counter: u64) -> ObjPath {
        self.revisions_dir().child(format!("{revision_counter:020}"))
    }
}

impl fmt::Display for CatalogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFilePath(ObjPath);

impl TransactionFilePath {
    pub fn new(prefix: &CatalogPrefix, revision_counter: u64, uuid: Uuid) -> Self {
        // pad number: `u64::MAX.to_string().len()` is 20
        Self(
            prefix
                .transactions_dir()
                .child(format!("{revision_counter:020}"))
                .child(format!("{uuid}.{TRANSACTION_FILE_EXTENSION}")),
        )
    }

    /// Extracts revision counter and UUID from a listed path.
    ///
    /// Returns `None` for anything that is not a transaction file of this catalog.
    pub fn parse(prefix: &CatalogPrefix, path: &ObjPath) -> Option<(u64, Uuid)> {
        let dir = prefix.transactions_dir();
        let parts: Vec<_> = path.prefix_match(&dir)?.collect();
        if parts.len() != 2 {
            return None;
        }

        let revision_counter = parts[0].as_ref().parse().ok()?;
        let (stem, extension) = parts[1].as_ref().split_once('.')?;
        if extension != TRANSACTION_FILE_EXTENSION {
            return None;
        }
        let uuid = Uuid::parse_str(stem).ok()?;

        Some((revision_counter, uuid))
    }
}

impl Deref for TransactionFilePath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Location of an immutable chunk artifact.
///
/// Every write of an artifact gets a fresh UUID in its file name, so a path is
/// written at most once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactPath(ObjPath);

impl ArtifactPath {
    pub fn new(prefix: &CatalogPrefix, addr: &ChunkAddr, uuid: Uuid) -> Self {
        Self(
            prefix
                .data_dir()
                .child(addr.table_name.as_ref())
                .child(addr.partition_key.as_ref())
                .child(format!(
                    "{}.{}.{ARTIFACT_FILE_EXTENSION}",
                    addr.chunk_id.get().simple(),
                    uuid.simple(),
                )),
        )
    }

    /// Wrap a listed path if it is an artifact below the data directory of `prefix`
    pub fn from_listed(prefix: &CatalogPrefix, path: &ObjPath) -> Option<Self> {
        path.prefix_match(&prefix.data_dir())?;
        (path.extension() == Some(ARTIFACT_FILE_EXTENSION)).then(|| Self(path.clone()))
    }
}

impl Deref for ArtifactPath {
    type Target = ObjPath;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<ObjPath> for ArtifactPath {
    fn as_ref(&self) -> &ObjPath {
        &self.0
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for ArtifactPath {
    type Error = object_store::path::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        ObjPath::parse(s).map(Self)
    }
}

impl From<ArtifactPath> for String {
    fn from(path: ArtifactPath) -> Self {
        path.0.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::chunk_metadata::{ChunkId, PartitionAddr};

    #[test]
    fn transaction_path_roundtrip() {
        let prefix = CatalogPrefix::new("catalog");
        let uuid = Uuid::from_u128(42);
        let path = TransactionFilePath::new(&prefix, 7, uuid);

        assert_eq!(
            path.to_string(),
            format!("catalog/transactions/00000000000000000007/{uuid}.txn")
        );
        assert_eq!(TransactionFilePath::parse(&prefix, &path), Some((7, uuid)));

        let claim = prefix.revision_claim(7);
        assert_eq!(claim.to_string(), "catalog/revisions/00000000000000000007");
        assert_eq!(TransactionFilePath::parse(&prefix, &claim), None);

        // foreign files are ignored
        for other in [
            "catalog/transactions/00000000000000000007/foo.json",
            "catalog/transactions/abc/00000000-0000-0000-0000-00000000002a.txn",
            "catalog/transactions/00000000-0000-0000-0000-00000000002a.txn",
            "other/transactions/00000000000000000007/00000000-0000-0000-0000-00000000002a.txn",
        ] {
            assert_eq!(
                TransactionFilePath::parse(&prefix, &ObjPath::from(other)),
                None,
                "{other}"
            );
        }
    }

    #[test]
    fn artifact_path_layout() {
        let prefix = CatalogPrefix::new("root/catalog");
        let addr = ChunkAddr::new(&PartitionAddr::new("sensors", "2023-01-01"), ChunkId::new_test(1));
        let path = ArtifactPath::new(&prefix, &addr, Uuid::from_u128(2));

        assert_eq!(
            path.to_string(),
            "root/catalog/data/sensors/2023-01-01/\
             00000000000000000000000000000001.00000000000000000000000000000002.chunk"
        );
        assert_eq!(ArtifactPath::from_listed(&prefix, &path), Some(path.clone()));
        assert_eq!(
            ArtifactPath::from_listed(&prefix, &ObjPath::from("root/catalog/data/x.parquet")),
            None
        );

        let json = serde_json::to_string(&path).unwrap();
        let back: ArtifactPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}

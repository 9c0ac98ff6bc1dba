//! Encoding of catalog files. Every file is written in a single PUT:
//!
//! ```text
//! <file type identifier (8 bytes)><crc32 of body (4 bytes, big endian)><JSON body>
//! ```
use std::{io::Cursor, mem::size_of};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid file identifier, expected {expected:?}")]
    InvalidFileType { expected: &'static str },

    #[error("file is truncated ({len} bytes)")]
    Truncated { len: usize },

    #[error("crc32 checksum mismatch")]
    Crc32Mismatch,

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifies a transaction file and its version.
pub(crate) const TRANSACTION_FILE_TYPE: &[u8; 8] = b"ccat.txn";

/// Identifies a chunk artifact and its version.
pub(crate) const ARTIFACT_FILE_TYPE: &[u8; 8] = b"ccat.chk";

const CHECKSUM_LEN: usize = size_of::<u32>();

pub(crate) fn verify_file_type_and_deserialize<T: DeserializeOwned>(
    file_type: &'static [u8; 8],
    b: Bytes,
) -> Result<T> {
    let pos = file_type.len();
    if b.len() < pos + CHECKSUM_LEN {
        return Err(Error::Truncated { len: b.len() });
    }

    if &b[..pos] != file_type {
        return Err(Error::InvalidFileType {
            expected: std::str::from_utf8(file_type).unwrap_or_default(),
        });
    }

    let mut cursor = Cursor::new(&b[pos..pos + CHECKSUM_LEN]);
    let crc32_checksum = cursor.read_u32::<BigEndian>()?;

    let data = &b[pos + CHECKSUM_LEN..];
    if crc32fast::hash(data) != crc32_checksum {
        return Err(Error::Crc32Mismatch);
    }

    Ok(serde_json::from_slice(data)?)
}

pub(crate) fn serialize_to_file_bytes<T: Serialize>(
    file_type: &'static [u8; 8],
    contents: &T,
) -> Result<Bytes> {
    let data = serde_json::to_vec(contents)?;

    let mut buf = Vec::with_capacity(file_type.len() + CHECKSUM_LEN + data.len());
    buf.extend_from_slice(file_type);
    buf.extend_from_slice(&crc32fast::hash(&data).to_be_bytes());
    buf.extend_from_slice(&data);

    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_serialize_deserialize() {
        let contents: BTreeMap<String, u64> = [("a".to_string(), 1), ("b".to_string(), 2)].into();

        let bytes = serialize_to_file_bytes(TRANSACTION_FILE_TYPE, &contents).unwrap();
        assert_eq!(&bytes[..8], b"ccat.txn");

        let back: BTreeMap<String, u64> =
            verify_file_type_and_deserialize(TRANSACTION_FILE_TYPE, bytes).unwrap();
        assert_eq!(back, contents);
    }

    #[test]
    fn test_rejects_wrong_type_and_corruption() {
        let bytes = serialize_to_file_bytes(ARTIFACT_FILE_TYPE, &vec![1u8, 2, 3]).unwrap();

        let err = verify_file_type_and_deserialize::<Vec<u8>>(TRANSACTION_FILE_TYPE, bytes.clone())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFileType { expected: "ccat.txn" }));

        let mut corrupted = bytes.to_vec();
        let last = corrupted.len() - 2;
        corrupted[last] = b'9';
        let err = verify_file_type_and_deserialize::<Vec<u8>>(
            ARTIFACT_FILE_TYPE,
            Bytes::from(corrupted),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Crc32Mismatch));

        let err = verify_file_type_and_deserialize::<Vec<u8>>(
            ARTIFACT_FILE_TYPE,
            Bytes::from_static(b"ccat"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Truncated { len: 4 }));
    }
}

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use gator::{BucketId, Payload, RecordKey, RecordStorage, StorageError, StorageLease};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Name of the per-bucket file listing keys in insertion order.
const INDEX_FILE: &str = ".keys";
const RECORD_SUFFIX: &str = ".json";
/// Directory under the root holding lock files. The leading `.` keeps it
/// apart from bucket directories, whose encoded names never start with one.
const LOCK_DIR: &str = ".locks";

/// Longest encoded key used verbatim as a file stem. Longer keys are stored
/// under a prefix of their encoding plus a digest of the whole key, so no
/// file name exceeds common filesystem limits.
const MAX_STEM_LEN: usize = 200;
const HASHED_PREFIX_LEN: usize = 120;

/// Record storage on the local filesystem.
///
/// Layout: one directory per bucket under the root, one JSON file per
/// record, and an append-only `.keys` index per bucket that fixes the
/// listing order. Bucket ids and keys are percent-encoded into file names;
/// keys too long for a file name are shortened with a digest suffix, while
/// `.keys` always keeps the full key. Named locks live in `.locks/`.
pub struct DiskStorage {
    root: PathBuf,
    // Serializes the exists-check, write and index append of a put.
    write_lock: Mutex<()>,
}

impl DiskStorage {
    /// Open (and create if needed) a storage root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| StorageError::Io(format!("{}: {e}", root.display())))?;

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &BucketId) -> PathBuf {
        self.root.join(encode_name(bucket.as_str()))
    }

    fn record_path(&self, bucket: &BucketId, key: &RecordKey) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!("{}{RECORD_SUFFIX}", record_stem(key.as_str())))
    }

    fn index_path(&self, bucket: &BucketId) -> PathBuf {
        self.bucket_dir(bucket).join(INDEX_FILE)
    }

    async fn bucket_exists(&self, bucket: &BucketId) -> Result<bool, StorageError> {
        tokio::fs::try_exists(self.bucket_dir(bucket))
            .await
            .map_err(io_error)
    }
}

#[async_trait::async_trait]
impl RecordStorage for DiskStorage {
    fn backend(&self) -> &str {
        "disk"
    }

    async fn put(
        &self,
        bucket: &BucketId,
        key: &RecordKey,
        payload: &Payload,
    ) -> Result<(), StorageError> {
        let contents =
            serde_json::to_vec(payload).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let dir = self.bucket_dir(bucket);
        let path = self.record_path(bucket, key);

        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
        let existed = tokio::fs::try_exists(&path).await.map_err(io_error)?;

        // Write then rename, so a reader never sees a half-written record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &contents).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)?;

        if !existed {
            let mut index = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.index_path(bucket))
                .await
                .map_err(io_error)?;
            index
                .write_all(format!("{}\n", encode_name(key.as_str())).as_bytes())
                .await
                .map_err(io_error)?;
            index.flush().await.map_err(io_error)?;
        }

        debug!(bucket_id = %bucket, %key, path = %path.display(), "wrote record file");
        Ok(())
    }

    async fn get(&self, bucket: &BucketId, key: &RecordKey) -> Result<Payload, StorageError> {
        let contents = match tokio::fs::read(self.record_path(bucket, key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(if self.bucket_exists(bucket).await? {
                    StorageError::NotFound {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    }
                } else {
                    StorageError::BucketNotFound(bucket.clone())
                });
            }
            Err(e) => return Err(io_error(e)),
        };

        serde_json::from_slice(&contents).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    async fn contains(&self, bucket: &BucketId, key: &RecordKey) -> Result<bool, StorageError> {
        tokio::fs::try_exists(self.record_path(bucket, key))
            .await
            .map_err(io_error)
    }

    async fn list_keys(&self, bucket: &BucketId) -> Result<Vec<RecordKey>, StorageError> {
        let index = match tokio::fs::read_to_string(self.index_path(bucket)).await {
            Ok(index) => index,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.bucket_exists(bucket).await? {
                    return Ok(Vec::new());
                }
                return Err(StorageError::BucketNotFound(bucket.clone()));
            }
            Err(e) => return Err(io_error(e)),
        };

        index
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                decode_name(line).map(RecordKey::new).ok_or_else(|| {
                    StorageError::Serialization(format!("corrupt key index entry: {line}"))
                })
            })
            .collect()
    }

    async fn list_buckets(&self) -> Result<Vec<BucketId>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_error)?;
        let mut buckets = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            if !entry.file_type().await.map_err(io_error)?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = decode_name(name) {
                buckets.push(BucketId::new(id));
            }
        }
        Ok(buckets)
    }

    async fn delete(&self, bucket: &BucketId, key: &RecordKey) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if !self.bucket_exists(bucket).await? {
            return Err(StorageError::BucketNotFound(bucket.clone()));
        }

        match tokio::fs::remove_file(self.record_path(bucket, key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(e)),
        }

        let index_path = self.index_path(bucket);
        let index = match tokio::fs::read_to_string(&index_path).await {
            Ok(index) => index,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(e)),
        };
        let encoded = encode_name(key.as_str());
        let remaining: String = index
            .lines()
            .filter(|line| !line.is_empty() && *line != encoded)
            .map(|line| format!("{line}\n"))
            .collect();

        let tmp = index_path.with_extension("tmp");
        tokio::fs::write(&tmp, remaining).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &index_path)
            .await
            .map_err(io_error)?;

        debug!(bucket_id = %bucket, %key, "deleted record file");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &BucketId) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_dir_all(self.bucket_dir(bucket)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(bucket.clone()))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    /// Locks are files under `.locks/` in the root. A process killed while
    /// holding one leaves the file behind; deleting it releases the lock.
    async fn try_lock(&self, name: &str) -> Result<Option<StorageLease>, StorageError> {
        let dir = self.root.join(LOCK_DIR);
        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
        let path = dir.join(format!("{}.lock", record_stem(name)));

        let file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };

        debug!(lock = %path.display(), "acquired lock");
        Ok(Some(StorageLease::new(LockFile { path, _file: file })))
    }
}

/// A lock file created with `create_new`. Removed on drop.
struct LockFile {
    path: PathBuf,
    _file: File,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

/// Percent-encode everything except ASCII alphanumerics, `-`, `_` and `.`.
/// A leading `.` is encoded too, so no name is hidden or a path component
/// like `..`.
fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// File stem for a key: its encoding, or for long keys a prefix of the
/// encoding followed by `~` and the key's SHA-256 in hex. `~` never occurs in
/// an encoded name, so the two forms cannot collide.
fn record_stem(key: &str) -> String {
    let encoded = encode_name(key);
    if encoded.len() <= MAX_STEM_LEN {
        return encoded;
    }

    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    // Encoded names are pure ASCII, so any byte index is a char boundary.
    format!("{}~{hex}", &encoded[..HASHED_PREFIX_LEN])
}

fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

// Durable state blobs.
//
// Opaque bytes keyed by storage key. The relay stores one full CRDT state
// per document and overwrites it in place on every flush.

use std::{
    collections::HashMap,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tokio::{io::AsyncWriteExt, sync::RwLock};
use uuid::Uuid;

pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub trait StateBlobStore: Send + Sync {
    /// Returns `None` when nothing was ever stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Option<Vec<u8>>>;

    /// Replaces whatever is stored under `key`.
    fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BlobFuture<'a, ()>;
}

/// One file per key under a root directory. Writes go to a temp file that
/// is synced and renamed over the target, so readers see either the old
/// blob or the new one.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create state directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.state", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }
}

impl StateBlobStore for FsBlobStore {
    fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let path = self.path_for(key);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
                Err(error) => Err(error)
                    .with_context(|| format!("failed to read state blob {}", path.display())),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key);
            let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

            let mut file = tokio::fs::File::create(&temp_path).await.with_context(|| {
                format!("failed to create temp state blob {}", temp_path.display())
            })?;
            let temp_display = temp_path.display();
            file.write_all(bytes)
                .await
                .with_context(|| format!("failed to write temp state blob {temp_display}"))?;
            file.sync_all()
                .await
                .with_context(|| format!("failed to sync temp state blob {temp_display}"))?;
            drop(file);

            if let Err(error) = tokio::fs::rename(&temp_path, &path).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(error)
                    .with_context(|| format!("failed to finalize state blob {}", path.display()));
            }

            Ok(())
        })
    }
}

/// In-process blob store for tests and ephemeral local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    puts: Arc<AtomicUsize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StateBlobStore for MemoryBlobStore {
    fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { Ok(self.blobs.read().await.get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            self.blobs.write().await.insert(key.to_owned(), bytes.to_vec());
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

//! Persistent key sets of cached tiles.
//!
//! A [`TileStore`] is the resume checkpoint of the tiling stage: a tile whose
//! name is already present is never extracted again. [`FsTileStore`] keeps
//! one PNG file per tile in the slide's cache directory; [`MemoryTileStore`]
//! keeps them in a map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::IoError;

use super::codec::TILE_EXTENSION;

/// Suffix of tiles that are still being written.
const PARTIAL_SUFFIX: &str = ".part";

/// Storage for encoded tiles, keyed by tile file name.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Whether a complete tile with this name exists.
    async fn contains(&self, name: &str) -> Result<bool, IoError>;

    /// Store a tile. Once this returns, `contains(name)` is true.
    async fn insert(&self, name: &str, data: Bytes) -> Result<(), IoError>;

    /// Read a stored tile.
    async fn read(&self, name: &str) -> Result<Bytes, IoError>;

    /// Names of all complete tiles, sorted.
    async fn names(&self) -> Result<Vec<String>, IoError>;
}

// =============================================================================
// FsTileStore
// =============================================================================

/// Tile files in one directory.
///
/// Tiles are written to `<name>.part` and renamed into place, so a crash
/// never leaves a truncated file under a valid tile name.
#[derive(Debug, Clone)]
pub struct FsTileStore {
    root: PathBuf,
}

impl FsTileStore {
    /// Open (creating if needed) a tile directory and drop stale partial files.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, IoError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                debug!(file = %entry.path().display(), "Removing partial tile");
                tokio::fs::remove_file(entry.path()).await?;
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl TileStore for FsTileStore {
    async fn contains(&self, name: &str) -> Result<bool, IoError> {
        Ok(tokio::fs::try_exists(self.path_of(name)).await?)
    }

    async fn insert(&self, name: &str, data: Bytes) -> Result<(), IoError> {
        let path = self.path_of(name);
        let partial = self.path_of(&format!("{}{}", name, PARTIAL_SUFFIX));
        tokio::fs::write(&partial, &data).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Bytes, IoError> {
        Ok(Bytes::from(tokio::fs::read(self.path_of(name)).await?))
    }

    async fn names(&self) -> Result<Vec<String>, IoError> {
        let suffix = format!(".{}", TILE_EXTENSION);
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(&suffix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

// =============================================================================
// MemoryTileStore
// =============================================================================

/// In-memory store that counts insertions.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tiles: RwLock<BTreeMap<String, Bytes>>,
    inserts: AtomicUsize,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `insert` calls so far.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub async fn remove(&self, name: &str) -> Option<Bytes> {
        self.tiles.write().await.remove(name)
    }

    pub async fn len(&self) -> usize {
        self.tiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tiles.read().await.is_empty()
    }
}

#[async_trait]
impl TileStore for MemoryTileStore {
    async fn contains(&self, name: &str) -> Result<bool, IoError> {
        Ok(self.tiles.read().await.contains_key(name))
    }

    async fn insert(&self, name: &str, data: Bytes) -> Result<(), IoError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.tiles.write().await.insert(name.to_string(), data);
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Bytes, IoError> {
        self.tiles
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| IoError::NotFound(name.to_string()))
    }

    async fn names(&self) -> Result<Vec<String>, IoError> {
        Ok(self.tiles.read().await.keys().cloned().collect())
    }
}

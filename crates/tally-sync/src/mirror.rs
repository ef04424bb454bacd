//! Best-effort on-disk mirror of the cache.
//!
//! The mirror only seeds a cold start. Loaded collections are marked stale
//! so every view refetches them on first use, and a missing or unreadable
//! mirror is never an error for the caller of [`load`].

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::SyncError;
use crate::cache::{CacheStore, CachedCollection};
use crate::key::CacheKey;

const MIRROR_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MirrorFile {
    version: u32,
    saved_at: DateTime<Utc>,
    collections: Vec<MirroredCollection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MirroredCollection {
    key: CacheKey,
    collection: CachedCollection,
}

/// Write every cached collection to `path`, replacing it atomically.
pub async fn save(store: &CacheStore, path: &Path) -> Result<usize, SyncError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let collections: Vec<MirroredCollection> = store
        .export()
        .into_iter()
        .map(|(key, collection)| MirroredCollection { key, collection })
        .collect();
    let count = collections.len();
    let content = serde_json::to_vec(&MirrorFile {
        version: MIRROR_VERSION,
        saved_at: Utc::now(),
        collections,
    })?;

    // Write to temp file first, then rename for atomicity
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, path).await?;

    info!(path = %path.display(), collections = count, "cache mirror saved");
    Ok(count)
}

/// Seed `store` from the mirror at `path`. Returns the number of
/// collections loaded; problems are logged and yield zero.
pub async fn load(store: &CacheStore, path: &Path) -> usize {
    match read(path).await {
        Ok(Some(file)) => {
            let count = file.collections.len();
            store.import(
                file.collections
                    .into_iter()
                    .map(|c| (c.key, c.collection))
                    .collect(),
            );
            info!(
                path = %path.display(),
                collections = count,
                saved_at = %file.saved_at,
                "cache mirror loaded"
            );
            count
        }
        Ok(None) => {
            debug!(path = %path.display(), "no cache mirror");
            0
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable cache mirror");
            0
        }
    }
}

async fn read(path: &Path) -> Result<Option<MirrorFile>, SyncError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file: MirrorFile = serde_json::from_slice(&bytes)?;
    if file.version != MIRROR_VERSION {
        return Err(SyncError::InvalidResponse(format!(
            "unsupported mirror version {}",
            file.version
        )));
    }
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{FilterDescriptor, Parent};
    use crate::types::{EntityTag, Page, Record};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn seeded() -> std::sync::Arc<CacheStore> {
        let store = CacheStore::new();
        store.set_pages(
            CacheKey::list(EntityTag::Sales, FilterDescriptor::new().status("open").page_size(8)),
            vec![Page::new(1, 8, vec![Record::new(2), Record::new(1)]).with_total(2)],
        );
        store.set_pages(
            CacheKey::linked(EntityTag::Payments, Parent::sale(2), FilterDescriptor::new()),
            vec![Page::new(1, 8, vec![Record::new(5)])],
        );
        store
    }

    #[tokio::test]
    async fn test_save_then_load_marks_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("mirror.json");
        let original = seeded();

        assert_eq!(save(&original, &path).await.unwrap(), 2);
        assert!(!path.with_extension("tmp").exists());

        let restored = CacheStore::new();
        assert_eq!(load(&restored, &path).await, 2);
        assert_eq!(restored.export(), original.export());
        for key in restored.keys() {
            assert!(restored.is_stale(&key));
        }
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_mirror_is_ignored() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new();
        assert_eq!(load(&store, &dir.path().join("absent.json")).await, 0);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, b"{not json").unwrap();
        assert_eq!(load(&store, &corrupt).await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_does_not_clobber_live_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        save(&seeded(), &path).await.unwrap();

        let store = CacheStore::new();
        let key = CacheKey::list(EntityTag::Sales, FilterDescriptor::new().status("open").page_size(8));
        store.set_pages(key.clone(), vec![Page::new(1, 8, vec![Record::new(9)])]);
        load(&store, &path).await;

        assert_eq!(store.get(&key).unwrap().ids(), vec![9]);
        assert!(!store.is_stale(&key));
    }
}

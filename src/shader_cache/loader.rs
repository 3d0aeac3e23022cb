//! Shader cache file I/O

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CacheError;

use super::format::ShaderCache;

/// Result of a background cache load
#[derive(Debug)]
pub struct CacheLoadCompletion {
    pub path: PathBuf,
    pub result: Result<ShaderCache, CacheError>,
}

/// Read and validate a cache file
pub async fn load(path: impl AsRef<Path>, transport_version: u32) -> Result<ShaderCache, CacheError> {
    let data = tokio::fs::read(path.as_ref()).await?;
    ShaderCache::from_bytes(&data, transport_version)
}

/// Write a cache file
pub async fn save(path: impl AsRef<Path>, cache: &ShaderCache) -> Result<(), CacheError> {
    tokio::fs::write(path.as_ref(), cache.to_bytes()).await?;
    tracing::info!(path = %path.as_ref().display(), entries = cache.len(), "Shader cache saved");
    Ok(())
}

/// Load a cache file on a separate task
///
/// The completion is delivered through `completions` so the update context
/// picks it up between frames instead of waiting on disk I/O.
pub fn load_async(
    path: impl Into<PathBuf>,
    transport_version: u32,
    completions: mpsc::Sender<CacheLoadCompletion>,
) -> JoinHandle<()> {
    let path = path.into();
    tokio::spawn(async move {
        let result = load(&path, transport_version).await;
        match &result {
            Ok(cache) => {
                tracing::info!(path = %path.display(), entries = cache.len(), "Shader cache loaded")
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Shader cache rejected"),
        }
        if completions.send(CacheLoadCompletion { path, result }).await.is_err() {
            tracing::debug!("Cache completion receiver dropped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader_cache::ShaderCacheEntry;
    use crate::transport::PROTOCOL_VERSION;
    use crate::types::SceneId;
    use bytes::Bytes;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("scene-relay-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn test_save_then_load_async() {
        let path = temp_path("cache.bin");
        let mut cache = ShaderCache::new();
        cache.insert(ShaderCacheEntry {
            effect: 1,
            scene: SceneId(2),
            format: 3,
            binary: Bytes::from_static(b"spirv"),
        });
        save(&path, &cache).await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        load_async(path.clone(), PROTOCOL_VERSION, tx).await.unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.path, path);
        assert_eq!(completion.result.unwrap(), cache);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_reports_io_error() {
        let (tx, mut rx) = mpsc::channel(1);
        load_async(temp_path("missing.bin"), PROTOCOL_VERSION, tx);
        let completion = rx.recv().await.unwrap();
        assert!(matches!(completion.result, Err(CacheError::Io(_))));
    }
}

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::RngCore;
use rustc_hash::FxHashMap;
use tempfile::TempDir;
use tracing::{debug, warn};

use super::{SharedRegion, ShmError};

const DIR_PREFIX: &str = "less-bridge-";
const KEY_PREFIX: &str = "lessbridge-";

/// Creates, tracks and destroys shared regions.
///
/// Regions created here live in a per-manager directory that is only readable by the current
/// user. Keys are random so concurrent compilations never collide.
pub struct ShmManager {
    dir: Mutex<Option<TempDir>>,
    regions: Mutex<FxHashMap<String, Arc<SharedRegion>>>,
    capacity: Option<usize>,
}

impl Default for ShmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmManager")
            .field("regions", &self.region_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ShmManager {
    pub fn new() -> Self {
        Self {
            dir: Mutex::new(None),
            regions: Mutex::new(FxHashMap::default()),
            capacity: None,
        }
    }

    /// A manager that refuses to hold more than `limit` bytes of owned regions at once.
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            dir: Mutex::new(None),
            regions: Mutex::new(FxHashMap::default()),
            capacity: Some(limit),
        }
    }

    pub fn create(&self, size: usize) -> Result<Arc<SharedRegion>, ShmError> {
        let mut regions = lock(&self.regions);

        if let Some(limit) = self.capacity {
            let used = regions.values().filter(|r| r.is_owned()).map(|r| r.size()).sum::<usize>();
            let available = limit.saturating_sub(used);
            if size > available {
                return Err(ShmError::CapacityExceeded {
                    requested: size,
                    available,
                });
            }
        }

        let dir = self.dir()?;
        let key = loop {
            let key = random_key();
            if !regions.contains_key(&key) {
                break key;
            }
        };
        let region = Arc::new(SharedRegion::create(key.clone(), dir.join(&key), size)?);
        debug!(key = %key, size, "Created shared region");
        regions.insert(key, Arc::clone(&region));
        Ok(region)
    }

    /// Maps a region created by the peer so it can be read; destroying it later only unmaps.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Arc<SharedRegion>, ShmError> {
        let region = Arc::new(SharedRegion::open_read_only(path)?);
        lock(&self.regions).insert(region.key().to_string(), Arc::clone(&region));
        Ok(region)
    }

    pub fn get(&self, key: &str) -> Option<Arc<SharedRegion>> {
        lock(&self.regions).get(key).cloned()
    }

    pub fn write(&self, key: &str, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        self.require(key)?.write(offset, data)
    }

    pub fn read(&self, key: &str, offset: usize, len: usize) -> Result<Vec<u8>, ShmError> {
        self.require(key)?.read(offset, len)
    }

    pub fn destroy(&self, key: &str) -> Result<(), ShmError> {
        let region = lock(&self.regions)
            .remove(key)
            .ok_or_else(|| ShmError::NotFound(key.to_string()))?;
        region.unmap()?;
        debug!(key, "Destroyed shared region");
        Ok(())
    }

    /// Destroys every tracked region and removes the private directory.
    pub fn destroy_all(&self) -> Result<(), ShmError> {
        let regions = std::mem::take(&mut *lock(&self.regions));
        let mut first_error = None;
        for (key, region) in regions {
            if let Err(e) = region.unmap() {
                warn!(key = %key, error = %e, "Failed to destroy shared region");
                first_error.get_or_insert(e);
            }
        }

        if let Some(dir) = lock(&self.dir).take() {
            let path = dir.path().to_path_buf();
            if let Err(source) = dir.close() {
                first_error.get_or_insert(ShmError::Io { path, source });
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn region_count(&self) -> usize {
        lock(&self.regions).len()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// The private directory regions are created in, created on first use.
    pub fn dir(&self) -> Result<PathBuf, ShmError> {
        let mut dir = lock(&self.dir);
        if let Some(dir) = dir.as_ref() {
            return Ok(dir.path().to_path_buf());
        }

        let created = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir()
            .map_err(|source| ShmError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let path = created.path().to_path_buf();
        *dir = Some(created);
        Ok(path)
    }

    fn require(&self, key: &str) -> Result<Arc<SharedRegion>, ShmError> {
        self.get(key).ok_or_else(|| ShmError::NotFound(key.to_string()))
    }
}

impl Drop for ShmManager {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_all() {
            warn!(error = %e, "Failed to clean up shared memory");
        }
    }
}

fn random_key() -> String {
    let mut rng = rand::thread_rng();
    format!("{KEY_PREFIX}{:016x}{:08x}", rng.next_u64(), rng.next_u32())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read_destroy() {
        let manager = ShmManager::new();
        let region = manager.create(128).unwrap();
        assert!(region.key().starts_with(KEY_PREFIX));
        assert!(region.path().starts_with(manager.dir().unwrap()));

        manager.write(region.key(), 4, b"abc").unwrap();
        assert_eq!(manager.read(region.key(), 4, 3).unwrap(), b"abc");

        let key = region.key().to_string();
        manager.destroy(&key).unwrap();
        assert!(manager.get(&key).is_none());
        assert!(matches!(manager.destroy(&key), Err(ShmError::NotFound(_))));
        assert!(matches!(region.read(0, 1), Err(ShmError::Destroyed(_))));
    }

    #[test]
    fn test_keys_are_unique() {
        let manager = ShmManager::new();
        let a = manager.create(8).unwrap();
        let b = manager.create(8).unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(manager.region_count(), 2);
    }

    #[test]
    fn test_capacity_limit() {
        let manager = ShmManager::with_capacity_limit(100);
        let first = manager.create(60).unwrap();
        assert!(matches!(
            manager.create(60),
            Err(ShmError::CapacityExceeded { requested: 60, available: 40 })
        ));
        manager.destroy(first.key()).unwrap();
        manager.create(60).unwrap();
    }

    #[test]
    fn test_zero_capacity_refuses_everything() {
        let manager = ShmManager::with_capacity_limit(0);
        assert!(matches!(manager.create(1), Err(ShmError::CapacityExceeded { .. })));
    }

    #[test]
    fn test_open_foreign_region() {
        let owner = ShmManager::new();
        let region = owner.create(16).unwrap();
        region.write_all(b"peer data").unwrap();
        region.sync().unwrap();

        let reader = ShmManager::new();
        let view = reader.open(region.path()).unwrap();
        assert_eq!(view.read(0, 9).unwrap(), b"peer data");
        reader.destroy(view.key()).unwrap();
        assert!(region.path().exists());
    }

    #[test]
    fn test_destroy_all_removes_directory() {
        let manager = ShmManager::new();
        let region = manager.create(16).unwrap();
        let dir = manager.dir().unwrap();
        manager.destroy_all().unwrap();
        assert_eq!(manager.region_count(), 0);
        assert!(!dir.exists());
        assert!(region.is_destroyed());
    }
}

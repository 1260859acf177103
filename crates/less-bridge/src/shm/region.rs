use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use memmap2::{Mmap, MmapMut, MmapOptions};

use super::ShmError;

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
    Unmapped,
}

/// A named, file-backed memory region shared with the peer process.
///
/// Every access is bounds-checked against the mapped size; once the region is destroyed all
/// operations fail with [`ShmError::Destroyed`].
pub struct SharedRegion {
    key: String,
    path: PathBuf,
    size: usize,
    owned: bool,
    map: RwLock<Mapping>,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("owned", &self.owned)
            .finish()
    }
}

impl SharedRegion {
    /// Creates the backing file at `path`, sizes it and maps it read-write.
    pub(crate) fn create(key: String, path: PathBuf, size: usize) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::InvalidSize);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| ShmError::Io {
                path: path.clone(),
                source,
            })?;
        file.set_len(size as u64).map_err(|source| ShmError::Io {
            path: path.clone(),
            source,
        })?;

        let map = map_read_write(&file, &path)?;
        Ok(Self {
            key,
            path,
            size,
            owned: true,
            map: RwLock::new(Mapping::ReadWrite(map)),
        })
    }

    /// Maps an existing region created by the other side, read-write.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| ShmError::Io {
                path: path.clone(),
                source,
            })?;
        let size = file_size(&file, &path)?;
        let map = map_read_write(&file, &path)?;
        Ok(Self {
            key: key_from_path(&path),
            path,
            size,
            owned: false,
            map: RwLock::new(Mapping::ReadWrite(map)),
        })
    }

    /// Maps an existing region created by the other side, read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| ShmError::Io {
            path: path.clone(),
            source,
        })?;
        let size = file_size(&file, &path)?;
        // SAFETY: the file stays open for the duration of the call; the mapping keeps its own reference.
        let map = unsafe { MmapOptions::new().len(size).map(&file) }.map_err(|source| ShmError::Map {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            key: key_from_path(&path),
            path,
            size,
            owned: false,
            map: RwLock::new(Mapping::ReadOnly(map)),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this process created the backing file and is responsible for removing it.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn is_writable(&self) -> bool {
        matches!(*self.read_lock(), Mapping::ReadWrite(_))
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(*self.read_lock(), Mapping::Unmapped)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), ShmError> {
        let mut map = self.write_lock();
        match &mut *map {
            Mapping::ReadWrite(mmap) => {
                let end = self.checked_end(offset, data.len()).ok_or(ShmError::WriteOutOfBounds {
                    offset,
                    len: data.len(),
                    size: self.size,
                })?;
                mmap[offset..end].copy_from_slice(data);
                Ok(())
            }
            Mapping::ReadOnly(_) => Err(ShmError::ReadOnly(self.key.clone())),
            Mapping::Unmapped => Err(ShmError::Destroyed(self.key.clone())),
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, ShmError> {
        self.view(offset, len, <[u8]>::to_vec)
    }

    /// Runs `f` over `len` bytes at `offset` without copying them out of the mapping.
    pub fn view<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, ShmError> {
        let map = self.read_lock();
        let bytes: &[u8] = match &*map {
            Mapping::ReadWrite(mmap) => &mmap[..],
            Mapping::ReadOnly(mmap) => &mmap[..],
            Mapping::Unmapped => return Err(ShmError::Destroyed(self.key.clone())),
        };
        let end = self
            .checked_end(offset, len)
            .ok_or(ShmError::ReadOutOfBounds {
                offset,
                len,
                size: self.size,
            })?;
        Ok(f(&bytes[offset..end]))
    }

    /// Writes `data` from the start of the region.
    pub fn write_all(&self, data: &[u8]) -> Result<(), ShmError> {
        self.write(0, data)
    }

    pub fn read_all(&self) -> Result<Vec<u8>, ShmError> {
        self.read(0, self.size)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ShmError> {
        let bytes = self.read(offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), ShmError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Flushes outstanding writes so the other process observes them.
    pub fn sync(&self) -> Result<(), ShmError> {
        match &*self.read_lock() {
            Mapping::ReadWrite(mmap) => mmap.flush().map_err(|source| ShmError::Io {
                path: self.path.clone(),
                source,
            }),
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::Unmapped => Err(ShmError::Destroyed(self.key.clone())),
        }
    }

    /// Flushes only `len` bytes at `offset`; used when polling a small control block.
    pub fn sync_range(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        let end = self.checked_end(offset, len).ok_or(ShmError::ReadOutOfBounds {
            offset,
            len,
            size: self.size,
        })?;
        match &*self.read_lock() {
            Mapping::ReadWrite(mmap) => mmap.flush_range(offset, end - offset).map_err(|source| ShmError::Io {
                path: self.path.clone(),
                source,
            }),
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::Unmapped => Err(ShmError::Destroyed(self.key.clone())),
        }
    }

    /// Unmaps the region and, if this process created it, removes the backing file.
    ///
    /// Returns `false` when the region had already been destroyed.
    pub(crate) fn unmap(&self) -> Result<bool, ShmError> {
        let previous = std::mem::replace(&mut *self.write_lock(), Mapping::Unmapped);
        if matches!(previous, Mapping::Unmapped) {
            return Ok(false);
        }
        drop(previous);

        if self.owned {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ShmError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
        Ok(true)
    }

    fn checked_end(&self, offset: usize, len: usize) -> Option<usize> {
        offset.checked_add(len).filter(|end| *end <= self.size)
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Mapping> {
        self.map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Mapping> {
        self.map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn map_read_write(file: &File, path: &Path) -> Result<MmapMut, ShmError> {
    // SAFETY: the region file lives in a private directory and is only resized at creation.
    unsafe { MmapOptions::new().map_mut(file) }.map_err(|source| ShmError::Map {
        path: path.to_path_buf(),
        source,
    })
}

fn file_size(file: &File, path: &Path) -> Result<usize, ShmError> {
    let len = file
        .metadata()
        .map_err(|source| ShmError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    match usize::try_from(len) {
        Ok(0) | Err(_) => Err(ShmError::InvalidSize),
        Ok(size) => Ok(size),
    }
}

fn key_from_path(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

//! Shared-memory tensor transport.
//!
//! A [`SharedMemoryRegion`] is a named file-backed mapping visible to both the
//! client and the server process. The server never creates regions on its
//! own: a client creates one, then registers named handles
//! ([`SharedMemoryBlock`]) that cover `offset..offset + byte_size` of it. Requests
//! refer to a handle by name, so no tensor payload crosses the wire protocol.
//!
//! No framing exists inside a region. Batch element `i` of a handle lives at
//! `i * per_instance_byte_size`, on both the writing and the reading side.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn normalize_key(key: &str) -> Result<&str> {
    let name = key.strip_prefix('/').unwrap_or(key);
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::invalid_arg(format!(
            "invalid shared memory key '{}'",
            key
        )));
    }
    Ok(name)
}

fn check_range(what: &str, offset: usize, len: usize, size: usize) -> Result<usize> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => Err(Error::invalid_arg(format!(
            "range {}..{}+{} exceeds {} of {} bytes",
            offset, offset, len, what, size
        ))),
    }
}

/// Identifies the file object behind a mapping, so a region that was
/// unlinked and recreated under the same key is not mistaken for the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    len: u64,
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    fn of(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            len: metadata.len(),
            #[cfg(unix)]
            dev: metadata.dev(),
            #[cfg(unix)]
            ino: metadata.ino(),
        }
    }
}

/// A file-backed memory mapping shared between processes under one key.
pub struct SharedMemoryRegion {
    key: String,
    path: PathBuf,
    byte_size: usize,
    identity: FileIdentity,
    map: RwLock<MmapMut>,
}

impl SharedMemoryRegion {
    /// Create a new region of `byte_size` zeroed bytes under `dir`.
    pub fn create(dir: &Path, key: &str, byte_size: usize) -> Result<Self> {
        let name = normalize_key(key)?;
        if byte_size == 0 {
            return Err(Error::invalid_arg(format!(
                "shared memory region '{}' must not be empty",
                key
            )));
        }

        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(byte_size as u64)?;
        let identity = FileIdentity::of(&file.metadata()?);
        let map = unsafe { MmapMut::map_mut(&file)? };

        tracing::debug!(key, byte_size, path = %path.display(), "created shared memory region");

        Ok(Self {
            key: key.to_string(),
            path,
            byte_size,
            identity,
            map: RwLock::new(map),
        })
    }

    /// Map an existing region.
    pub fn open(dir: &Path, key: &str) -> Result<Self> {
        let name = normalize_key(key)?;
        let path = dir.join(name);
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("shared memory region '{}' does not exist", key))
            } else {
                e.into()
            }
        })?;

        let identity = FileIdentity::of(&file.metadata()?);
        let byte_size = usize::try_from(identity.len).map_err(|_| {
            Error::invalid_arg(format!("shared memory region '{}' exceeds addressable memory", key))
        })?;
        if byte_size == 0 {
            return Err(Error::invalid_arg(format!(
                "shared memory region '{}' is empty",
                key
            )));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            key: key.to_string(),
            path,
            byte_size,
            identity,
            map: RwLock::new(map),
        })
    }

    /// Whether the object at this region's path is still the one mapped.
    fn is_current(&self) -> bool {
        fs::metadata(&self.path)
            .map(|metadata| FileIdentity::of(&metadata) == self.identity)
            .unwrap_or(false)
    }

    /// Remove the backing object. Existing mappings stay valid until dropped.
    pub fn unlink(dir: &Path, key: &str) -> Result<()> {
        let name = normalize_key(key)?;
        fs::remove_file(dir.join(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("shared memory region '{}' does not exist", key))
            } else {
                e.into()
            }
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = check_range("region", offset, data.len(), self.byte_size)?;
        self.map.write()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the region at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let end = check_range("region", offset, len, self.byte_size)?;
        Ok(self.map.read()[offset..end].to_vec())
    }
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

/// A registered, named byte range of a region.
#[derive(Debug)]
pub struct SharedMemoryBlock {
    name: String,
    region: Arc<SharedMemoryRegion>,
    offset: usize,
    byte_size: usize,
}

impl SharedMemoryBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region_key(&self) -> &str {
        self.region.key()
    }

    /// Offset of the block inside its region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Read `len` bytes at `offset` relative to the start of the block.
    pub fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        check_range(&format!("shared memory '{}'", self.name), offset, len, self.byte_size)?;
        Ok(Bytes::from(self.region.read_at(self.offset + offset, len)?))
    }

    /// Write `data` at `offset` relative to the start of the block.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        check_range(&format!("shared memory '{}'", self.name), offset, data.len(), self.byte_size)?;
        self.region.write_at(self.offset + offset, data)
    }

    /// Read batch element `index` of a block laid out with `stride` bytes per element.
    pub fn element(&self, index: usize, stride: usize) -> Result<Bytes> {
        let offset = index
            .checked_mul(stride)
            .ok_or_else(|| Error::invalid_arg("batch element offset overflows"))?;
        self.read(offset, stride)
    }
}

/// Registration record reported by [`SharedMemoryManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryStatus {
    pub name: String,
    pub region_key: String,
    pub offset: usize,
    pub byte_size: usize,
}

/// Server-side registry of shared-memory handles.
#[derive(Debug)]
pub struct SharedMemoryManager {
    dir: PathBuf,
    regions: Mutex<HashMap<String, Weak<SharedMemoryRegion>>>,
    blocks: RwLock<BTreeMap<String, Arc<SharedMemoryBlock>>>,
}

impl SharedMemoryManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            regions: Mutex::new(HashMap::new()),
            blocks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Associate `name` with `offset..offset + byte_size` of region `region_key`.
    pub fn register(&self, name: &str, region_key: &str, offset: usize, byte_size: usize) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_arg("shared memory handle name must not be empty"));
        }

        let mut blocks = self.blocks.write();
        if blocks.contains_key(name) {
            return Err(Error::already_exists(format!(
                "shared memory handle '{}' is already registered",
                name
            )));
        }

        let region = self.map_region(region_key)?;
        check_range(
            &format!("shared memory region '{}'", region_key),
            offset,
            byte_size,
            region.byte_size(),
        )?;

        blocks.insert(
            name.to_string(),
            Arc::new(SharedMemoryBlock {
                name: name.to_string(),
                region,
                offset,
                byte_size,
            }),
        );

        tracing::info!(name, region_key, offset, byte_size, "registered shared memory");
        Ok(())
    }

    /// Remove a handle. Requests already holding it are unaffected.
    pub fn unregister(&self, name: &str) -> Result<()> {
        match self.blocks.write().remove(name) {
            Some(_) => {
                tracing::info!(name, "unregistered shared memory");
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "shared memory handle '{}' is not registered",
                name
            ))),
        }
    }

    pub fn unregister_all(&self) {
        let removed = std::mem::take(&mut *self.blocks.write());
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "unregistered all shared memory");
        }
    }

    /// Look up a registered handle.
    pub fn get(&self, name: &str) -> Result<Arc<SharedMemoryBlock>> {
        self.blocks.read().get(name).cloned().ok_or_else(|| {
            Error::not_found(format!("shared memory handle '{}' is not registered", name))
        })
    }

    pub fn status(&self) -> Vec<SharedMemoryStatus> {
        self.blocks
            .read()
            .values()
            .map(|block| SharedMemoryStatus {
                name: block.name.clone(),
                region_key: block.region_key().to_string(),
                offset: block.offset,
                byte_size: block.byte_size,
            })
            .collect()
    }

    /// One mapping per backing object, shared by every handle that refers to it.
    fn map_region(&self, key: &str) -> Result<Arc<SharedMemoryRegion>> {
        let name = normalize_key(key)?;
        let mut regions = self.regions.lock();
        if let Some(region) = regions.get(name).and_then(Weak::upgrade) {
            if region.is_current() {
                return Ok(region);
            }
            tracing::debug!(key, "shared memory region was replaced, remapping");
        }

        let region = Arc::new(SharedMemoryRegion::open(&self.dir, key)?);
        regions.retain(|_, weak| weak.strong_count() > 0);
        regions.insert(name.to_string(), Arc::downgrade(&region));
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_key_normalization() {
        assert_eq!(normalize_key("/input_data").unwrap(), "input_data");
        assert_eq!(normalize_key("input_data").unwrap(), "input_data");
        assert!(normalize_key("/a/b").is_err());
        assert!(normalize_key("/").is_err());
        assert!(normalize_key("..").is_err());
    }

    #[test]
    fn test_region_create_open_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedMemoryRegion::create(dir.path(), "/input_data", 16).unwrap();
        region.write_at(4, &[9, 8, 7]).unwrap();

        let other = SharedMemoryRegion::open(dir.path(), "/input_data").unwrap();
        assert_eq!(other.byte_size(), 16);
        assert_eq!(other.read_at(4, 3).unwrap(), vec![9, 8, 7]);

        let err = SharedMemoryRegion::create(dir.path(), "/input_data", 16).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);

        SharedMemoryRegion::unlink(dir.path(), "/input_data").unwrap();
        let err = SharedMemoryRegion::open(dir.path(), "/input_data").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_region_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedMemoryRegion::create(dir.path(), "r", 8).unwrap();
        assert!(region.write_at(6, &[1, 2]).is_ok());
        assert_eq!(region.write_at(7, &[1, 2]).unwrap_err().code(), ErrorCode::InvalidArg);
        assert_eq!(region.read_at(usize::MAX, 2).unwrap_err().code(), ErrorCode::InvalidArg);
        assert_eq!(
            SharedMemoryRegion::create(dir.path(), "empty", 0).unwrap_err().code(),
            ErrorCode::InvalidArg
        );
    }

    #[test]
    fn test_register_validation() {
        let dir = tempfile::tempdir().unwrap();
        let _region = SharedMemoryRegion::create(dir.path(), "/data", 64).unwrap();
        let manager = SharedMemoryManager::new(dir.path());

        manager.register("batch0", "/data", 0, 32).unwrap();
        assert_eq!(
            manager.register("batch0", "/data", 32, 32).unwrap_err().code(),
            ErrorCode::AlreadyExists
        );
        assert_eq!(
            manager.register("batch1", "/data", 40, 32).unwrap_err().code(),
            ErrorCode::InvalidArg
        );
        assert_eq!(
            manager.register("batch1", "/missing", 0, 8).unwrap_err().code(),
            ErrorCode::NotFound
        );
        manager.register("batch1", "/data", 32, 32).unwrap();

        let status = manager.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].offset, 32);
    }

    #[test]
    fn test_unregister_and_reregister() {
        let dir = tempfile::tempdir().unwrap();
        let region = SharedMemoryRegion::create(dir.path(), "/data", 64).unwrap();
        region.write_at(0, &[1; 8]).unwrap();
        region.write_at(16, &[2; 8]).unwrap();

        let manager = SharedMemoryManager::new(dir.path());
        manager.register("h", "/data", 0, 8).unwrap();
        let held = manager.get("h").unwrap();

        manager.unregister("h").unwrap();
        assert_eq!(manager.get("h").unwrap_err().code(), ErrorCode::NotFound);
        assert_eq!(manager.unregister("h").unwrap_err().code(), ErrorCode::NotFound);

        // A holder of the old association still reads the old range
        assert_eq!(held.read(0, 8).unwrap().as_ref(), &[1; 8]);

        manager.register("h", "/data", 16, 8).unwrap();
        let fresh = manager.get("h").unwrap();
        assert_eq!(fresh.offset(), 16);
        assert_eq!(fresh.read(0, 8).unwrap().as_ref(), &[2; 8]);
        assert_eq!(manager.status().len(), 1);
    }

    #[test]
    fn test_recreated_region_is_remapped() {
        let dir = tempfile::tempdir().unwrap();
        let old = SharedMemoryRegion::create(dir.path(), "/data", 64).unwrap();
        old.write_at(0, &[1; 8]).unwrap();
        let manager = SharedMemoryManager::new(dir.path());
        manager.register("a", "/data", 0, 64).unwrap();

        SharedMemoryRegion::unlink(dir.path(), "/data").unwrap();
        let new = SharedMemoryRegion::create(dir.path(), "/data", 128).unwrap();
        new.write_at(64, &[9; 8]).unwrap();

        manager.register("b", "/data", 64, 64).unwrap();
        assert_eq!(manager.get("b").unwrap().read(0, 8).unwrap().as_ref(), &[9; 8]);

        // The old handle keeps the unlinked mapping
        assert_eq!(manager.get("a").unwrap().read(0, 8).unwrap().as_ref(), &[1; 8]);
    }

    #[test]
    fn test_equivalent_keys_share_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let _region = SharedMemoryRegion::create(dir.path(), "/data", 16).unwrap();
        let manager = SharedMemoryManager::new(dir.path());
        manager.register("slash", "/data", 0, 8).unwrap();
        manager.register("bare", "data", 8, 8).unwrap();

        let slash = manager.get("slash").unwrap();
        let bare = manager.get("bare").unwrap();
        assert!(Arc::ptr_eq(&slash.region, &bare.region));
    }

    #[test]
    fn test_block_strided_elements() {
        let dir = tempfile::tempdir().unwrap();
        let client = SharedMemoryRegion::create(dir.path(), "/batched", 48).unwrap();
        let manager = SharedMemoryManager::new(dir.path());
        manager.register("batch", "/batched", 12, 36).unwrap();
        let block = manager.get("batch").unwrap();

        for i in 0..3u8 {
            client.write_at(12 + i as usize * 12, &[i + 1; 12]).unwrap();
        }
        for i in 0..3 {
            assert_eq!(block.element(i, 12).unwrap().as_ref(), &[i as u8 + 1; 12]);
        }
        assert_eq!(block.element(3, 12).unwrap_err().code(), ErrorCode::InvalidArg);

        block.write(0, &[0xff; 4]).unwrap();
        assert_eq!(client.read_at(12, 4).unwrap(), vec![0xff; 4]);
    }

    #[test]
    fn test_unregister_all() {
        let dir = tempfile::tempdir().unwrap();
        let _region = SharedMemoryRegion::create(dir.path(), "d", 8).unwrap();
        let manager = SharedMemoryManager::new(dir.path());
        manager.register("a", "d", 0, 4).unwrap();
        manager.register("b", "d", 4, 4).unwrap();
        manager.unregister_all();
        assert!(manager.status().is_empty());
    }
}

//! Disk tier backend.
//!
//! Layout is one file per payload, `<root>/<id>.bin` with the canonical
//! dashed id form. Writes are atomic: bytes land in `<id>.bin.tmp`, are
//! optionally fsynced, then renamed over the final path. Reads are
//! read-only memory maps, so consumers see the page cache instead of a
//! copy.

use async_trait::async_trait;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::{Error, Location, PayloadId, Result, Tier};

use super::{Buffer, StorageBackend};

/// Local-disk tier backend.
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Create the backend, ensuring the root directory exists.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn payload_path(&self, id: &PayloadId) -> PathBuf {
        self.root.join(format!("{}.bin", id.canonical()))
    }

    fn tmp_path(&self, id: &PayloadId) -> PathBuf {
        self.root.join(format!("{}.bin.tmp", id.canonical()))
    }
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn allocate(&self, _id: &PayloadId, _size_bytes: u64) -> Result<Location> {
        Err(Error::Unsupported(
            "disk tier does not support direct allocation".to_string(),
        ))
    }

    async fn read(&self, id: &PayloadId) -> Result<Buffer> {
        let path = self.payload_path(id);
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("disk payload {}", id)),
            _ => Error::Io(format!("open {}: {}", path.display(), e)),
        })?;
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Io(format!("mmap {}: {}", path.display(), e)))?;
        Ok(Buffer::Mapped(Arc::new(map)))
    }

    async fn size(&self, id: &PayloadId) -> Result<u64> {
        let path = self.payload_path(id);
        let meta = std::fs::metadata(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("disk payload {}", id)),
            _ => Error::Io(format!("stat {}: {}", path.display(), e)),
        })?;
        Ok(meta.len())
    }

    async fn write(&self, id: &PayloadId, data: &[u8], fsync: bool) -> Result<()> {
        let tmp = self.tmp_path(id);
        let final_path = self.payload_path(id);

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| Error::Io(format!("create {}: {}", tmp.display(), e)))?;
            file.write_all(data)
                .map_err(|e| Error::Io(format!("write {}: {}", tmp.display(), e)))?;
            if fsync {
                file.sync_all()
                    .map_err(|e| Error::Io(format!("fsync {}: {}", tmp.display(), e)))?;
            }
        }

        std::fs::rename(&tmp, &final_path)
            .map_err(|e| Error::Io(format!("rename into {}: {}", final_path.display(), e)))?;
        Ok(())
    }

    async fn remove(&self, id: &PayloadId) -> Result<()> {
        match std::fs::remove_file(self.payload_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(format!("remove {}: {}", id, e))),
        }
    }

    fn location(&self, id: &PayloadId, length: u64) -> Location {
        Location::Disk {
            path: self.payload_path(id).to_string_lossy().into_owned(),
            offset: 0,
            length,
        }
    }

    fn tier_type(&self) -> Tier {
        Tier::Disk
    }
}

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{MapError, Result};

/// Memory-mapped file that grows in whole storage pages.
///
/// All reads and writes go through offset-based accessors instead of
/// long-lived views, so the mapping can be replaced on growth without
/// invalidating anything. The file length is always kept equal to the
/// mapped length.
pub struct MMapFile {
    path: PathBuf,
    file: File,
    page_size: usize,
    // None while the file is still empty, and after close()
    mmap: Option<MmapMut>,
    file_size: u64,
    closed: bool,
}

impl MMapFile {
    /// Opens (creating if absent) the file at `path`, mapping its current
    /// contents. `page_size` is the growth granularity and must be a
    /// non-zero power of two.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(MapError::InvalidArgument(format!(
                "page_size({page_size}) must be a non-zero power of 2"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_size = file.metadata()?.len();
        let mmap = if file_size > 0 {
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        debug!(path = %path.display(), file_size, page_size, "mapped storage file");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            page_size,
            mmap,
            file_size,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current length of the backing file in bytes.
    pub fn actual_file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Grows the file (in whole pages) and remaps it so that bytes up to
    /// `end` are addressable. No-op when `end` is already mapped.
    pub fn ensure_mapped(&mut self, end: u64) -> Result<()> {
        self.check_open()?;
        if end <= self.file_size && self.mmap.is_some() {
            return Ok(());
        }
        let page = self.page_size as u64;
        let new_size = end.div_ceil(page).max(1) * page;
        if new_size > self.file_size {
            self.file.set_len(new_size)?;
            self.file_size = new_size;
        }
        self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });
        Ok(())
    }

    /// Borrows `len` bytes starting at `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let mmap = self.mapped()?;
        let end = offset + len as u64;
        if end > mmap.len() as u64 {
            return Err(MapError::Corrupted(format!(
                "read of [{offset}..{end}) is beyond mapped length {}",
                mmap.len()
            )));
        }
        Ok(&mmap[offset as usize..end as usize])
    }

    /// Mutably borrows `len` bytes starting at `offset`.
    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        self.check_open()?;
        let file_size = self.file_size;
        let Some(mmap) = self.mmap.as_mut() else {
            return Err(MapError::Corrupted(format!(
                "write at offset {offset} into an empty (unmapped) file"
            )));
        };
        let end = offset + len as u64;
        if end > file_size {
            return Err(MapError::Corrupted(format!(
                "write of [{offset}..{end}) is beyond mapped length {file_size}"
            )));
        }
        Ok(&mut mmap[offset as usize..end as usize])
    }

    /// Single-integer read used on hot paths that must not construct views.
    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let bytes = self.slice(offset, 4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrites everything from `offset` to the end of the file with
    /// zeroes. The file length does not change.
    pub fn zeroize_till_eof(&mut self, offset: u64) -> Result<()> {
        self.check_open()?;
        if let Some(mmap) = self.mmap.as_mut() {
            let from = (offset as usize).min(mmap.len());
            mmap[from..].fill(0);
        }
        Ok(())
    }

    /// Flushes mapped pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        Ok(())
    }

    /// Flushes and releases the mapping. Idempotent; any access after this
    /// fails with a closed-storage error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        self.mmap = None;
        self.closed = true;
        debug!(path = %self.path.display(), "closed storage file");
        Ok(())
    }

    /// Closes the mapping and deletes the backing file.
    pub fn close_and_clean(&mut self) -> Result<()> {
        self.close()?;
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(MapError::Closed(format!(
                "storage file {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn mapped(&self) -> Result<&MmapMut> {
        self.check_open()?;
        match &self.mmap {
            Some(mmap) => Ok(mmap),
            None => Err(MapError::Corrupted(
                "read from an empty (unmapped) file".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for MMapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MMapFile")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("page_size", &self.page_size)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_file_is_empty_and_unmapped() {
        let dir = tempdir().unwrap();
        let store = MMapFile::open(&dir.path().join("data.bin"), 4096).unwrap();
        assert_eq!(store.actual_file_size(), 0);
        assert!(store.is_open());
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        assert!(matches!(
            MMapFile::open(&path, 0),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(matches!(
            MMapFile::open(&path, 1000),
            Err(MapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_grows_in_whole_pages() {
        let dir = tempdir().unwrap();
        let mut store = MMapFile::open(&dir.path().join("data.bin"), 4096).unwrap();

        store.ensure_mapped(10).unwrap();
        assert_eq!(store.actual_file_size(), 4096);

        store.ensure_mapped(4096).unwrap();
        assert_eq!(store.actual_file_size(), 4096);

        store.ensure_mapped(4097).unwrap();
        assert_eq!(store.actual_file_size(), 8192);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = MMapFile::open(&dir.path().join("data.bin"), 4096).unwrap();
        store.ensure_mapped(64).unwrap();

        store.slice_mut(16, 4).unwrap().copy_from_slice(&7u32.to_ne_bytes());
        assert_eq!(store.read_u32(16).unwrap(), 7);
        assert_eq!(store.slice(16, 4).unwrap(), &7u32.to_ne_bytes());
    }

    #[test]
    fn test_out_of_bounds_read_is_an_error() {
        let dir = tempdir().unwrap();
        let mut store = MMapFile::open(&dir.path().join("data.bin"), 4096).unwrap();
        store.ensure_mapped(1).unwrap();
        assert!(matches!(
            store.read_u32(4094),
            Err(MapError::Corrupted(_))
        ));
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        {
            let mut store = MMapFile::open(&path, 4096).unwrap();
            store.ensure_mapped(8).unwrap();
            store
                .slice_mut(0, 8)
                .unwrap()
                .copy_from_slice(&0xDEAD_BEEF_CAFE_F00Du64.to_ne_bytes());
            store.close().unwrap();
        }
        let store = MMapFile::open(&path, 4096).unwrap();
        assert_eq!(store.actual_file_size(), 4096);
        assert_eq!(
            store.slice(0, 8).unwrap(),
            &0xDEAD_BEEF_CAFE_F00Du64.to_ne_bytes()
        );
    }

    #[test]
    fn test_zeroize_till_eof() {
        let dir = tempdir().unwrap();
        let mut store = MMapFile::open(&dir.path().join("data.bin"), 4096).unwrap();
        store.ensure_mapped(32).unwrap();
        store.slice_mut(0, 32).unwrap().fill(0xFF);

        store.zeroize_till_eof(8).unwrap();
        assert_eq!(store.slice(0, 8).unwrap(), &[0xFF; 8]);
        assert_eq!(store.slice(8, 24).unwrap(), &[0u8; 24]);
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let mut store = MMapFile::open(&dir.path().join("data.bin"), 4096).unwrap();
        store.ensure_mapped(8).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.read_u32(0), Err(MapError::Closed(_))));
        assert!(matches!(store.ensure_mapped(16), Err(MapError::Closed(_))));
    }

    #[test]
    fn test_close_and_clean_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut store = MMapFile::open(&path, 4096).unwrap();
        store.ensure_mapped(8).unwrap();
        store.close_and_clean().unwrap();
        assert!(!path.exists());
    }
}

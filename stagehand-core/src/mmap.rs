use std::fs::File;
use std::path::Path;

use crate::error::Result;

/// Map a vocabulary or stage file read-only.
/// Files under `MMAP_THRESHOLD` bytes are read into memory instead.
pub fn map_file(path: &Path) -> Result<MappedFile> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    if len < MMAP_THRESHOLD {
        let bytes = std::fs::read(path)?;
        tracing::debug!(bytes = bytes.len(), "map_file: read into memory");
        return Ok(MappedFile::Owned(bytes));
    }

    // the file is only ever read, and nothing in this process writes to it while mapped
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    tracing::debug!("map_file: mapped ({}KB)", mmap.len() / 1024);
    Ok(MappedFile::Mapped(mmap))
}

const MMAP_THRESHOLD: u64 = 64 * 1024;

pub enum MappedFile {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl AsRef<[u8]> for MappedFile {
    fn as_ref(&self) -> &[u8] {
        match self {
            MappedFile::Mapped(m) => m.as_ref(),
            MappedFile::Owned(v) => v.as_slice(),
        }
    }
}

//! Read-only random access over a world file.
//!
//! A [`ByteRegion`] is either a read-only memory map of a file or an owned
//! buffer. Reads borrow from the region, so any number of lookups can be in
//! flight at once without a shared cursor.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

pub struct ByteRegion {
    backing: Backing,
}

impl ByteRegion {
    /// Map `path` read-only. The mapping is released when the region drops.
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // mmap of a zero-length file fails on some platforms.
        if len == 0 {
            return Ok(Self::from_vec(Vec::new()));
        }
        // SAFETY: the map is read-only; callers must not truncate the file
        // while a reader holds it.
        let mmap = unsafe { Mmap::map(&file)? };
        tracing::debug!(path = %path.display(), len, "mapped world file");
        Ok(Self {
            backing: Backing::Mapped(mmap),
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(data),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(m) => &m[..],
            Backing::Owned(v) => v.as_slice(),
        }
    }

    pub fn size(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Borrow `length` bytes starting at `offset`.
    pub fn read(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let size = self.size();
        let out_of_range = || Error::OutOfRange {
            offset,
            length,
            size,
        };
        let end = offset.checked_add(length).ok_or_else(out_of_range)?;
        if end > size {
            return Err(out_of_range());
        }
        Ok(&self.as_bytes()[offset as usize..end as usize])
    }
}

impl std::fmt::Debug for ByteRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRegion")
            .field("size", &self.size())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(feature = "filemap")]
use {memmap::Mmap, std::sync::Arc};

use kdumpflow_core::error::{Error, ErrorKind, ErrorOrigin, Result};

/// The bytes of an image file, either read on demand or mapped.
pub enum Backing {
    File(File),
    #[cfg(feature = "filemap")]
    Mapped(Arc<Mmap>),
}

impl Backing {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::from_io(ErrorOrigin::Source, ErrorKind::UnableToOpenFile, &e)
                .log_error(format!("{}: {}", path.display(), e))
        })?;
        Ok(Backing::File(file))
    }

    /// Maps the whole file read-only.
    #[cfg(feature = "filemap")]
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::from_io(ErrorOrigin::Source, ErrorKind::UnableToOpenFile, &e)
                .log_error(format!("{}: {}", path.display(), e))
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            Error::from_io(ErrorOrigin::Source, ErrorKind::UnableToMapFile, &e)
                .log_error(format!("{}: {}", path.display(), e))
        })?;
        Ok(Backing::Mapped(Arc::new(map)))
    }

    /// Another handle to the same file.
    pub fn reopen(&self, path: &Path) -> Result<Self> {
        match self {
            Backing::File(_) => Self::open(path),
            #[cfg(feature = "filemap")]
            Backing::Mapped(map) => Ok(Backing::Mapped(map.clone())),
        }
    }

    /// Size of the image in bytes.
    pub fn size(&self) -> Result<u64> {
        match self {
            Backing::File(file) => file.metadata().map(|m| m.len()).map_err(|e| {
                Error::from_io(ErrorOrigin::Source, ErrorKind::UnableToReadFile, &e)
                    .log_error(format!("unable to stat the image: {}", e))
            }),
            #[cfg(feature = "filemap")]
            Backing::Mapped(map) => Ok(map.len() as u64),
        }
    }

    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        match self {
            Backing::File(file) => file.read_exact_at(out, offset).map_err(|e| {
                Error::from_io(ErrorOrigin::Source, ErrorKind::UnableToReadFile, &e)
                    .log_error(format!("{} bytes at offset {:x}: {}", out.len(), offset, e))
            }),
            #[cfg(feature = "filemap")]
            Backing::Mapped(map) => {
                let end = offset as usize + out.len();
                let data = map.get(offset as usize..end).ok_or_else(|| {
                    Error(ErrorOrigin::Source, ErrorKind::OutOfBounds)
                        .log_error(format!("offset {:x}-{:x} beyond the mapping of {:x}", offset, end, map.len()))
                })?;
                out.copy_from_slice(data);
                Ok(())
            }
        }
    }
}

/*!
Scratch file holding the whole-machine bitmaps.
*/

use std::fs::File;
use std::path::Path;

use log::debug;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::{divideup, roundup, Pfn};

use super::full::BlockBitmap;
use super::DumpBitmaps;

/// Size of both bitmaps together, each rounded up to whole pages.
pub fn bitmap_len(max_mapnr: Pfn, page_size: u64) -> u64 {
    2 * roundup(divideup(max_mapnr, 8), page_size)
}

/// The 1st bitmap lives in the first half of the file, the 2nd in the second.
pub struct BitmapStore {
    file: File,
    max_mapnr: Pfn,
    len_bitmap: u64,
}

impl BitmapStore {
    /// Creates the store in the system temporary directory.
    pub fn new(max_mapnr: Pfn, page_size: u64) -> Result<Self> {
        let file = tempfile::tempfile().map_err(|e| {
            Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToOpenFile, &e)
                .log_error(format!("unable to create bitmap file: {}", e))
        })?;
        Self::with_file(file, max_mapnr, page_size)
    }

    /// Creates the store in `dir`, e.g. the directory named by `TMPDIR` on the
    /// command line.
    pub fn new_in<P: AsRef<Path>>(dir: P, max_mapnr: Pfn, page_size: u64) -> Result<Self> {
        let file = tempfile::tempfile_in(dir.as_ref()).map_err(|e| {
            Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToOpenFile, &e).log_error(format!(
                "unable to create bitmap file in {}: {}",
                dir.as_ref().display(),
                e
            ))
        })?;
        Self::with_file(file, max_mapnr, page_size)
    }

    fn with_file(file: File, max_mapnr: Pfn, page_size: u64) -> Result<Self> {
        let len_bitmap = bitmap_len(max_mapnr, page_size);
        file.set_len(len_bitmap).map_err(|e| {
            Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToWriteFile, &e)
                .log_error(format!("unable to size bitmap file to {} bytes: {}", len_bitmap, e))
        })?;
        debug!("bitmap store: max_mapnr={:x} len_bitmap={:x}", max_mapnr, len_bitmap);
        Ok(Self {
            file,
            max_mapnr,
            len_bitmap,
        })
    }

    pub fn len_bitmap(&self) -> u64 {
        self.len_bitmap
    }

    /// Opens independent handles on both bitmaps.
    ///
    /// Handles share the underlying file, so a bitmap built through one set
    /// is visible through every set opened afterwards.
    pub fn bitmaps(&self) -> Result<DumpBitmaps<BlockBitmap>> {
        let half = self.len_bitmap / 2;
        Ok(DumpBitmaps::new(
            BlockBitmap::new(self.clone_file()?, 0, half, self.max_mapnr),
            BlockBitmap::new(self.clone_file()?, half, half, self.max_mapnr),
        ))
    }

    fn clone_file(&self) -> Result<File> {
        self.file.try_clone().map_err(|e| {
            Error::from_io(ErrorOrigin::Bitmap, ErrorKind::UnableToOpenFile, &e)
                .log_error(format!("unable to duplicate bitmap file handle: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;

    #[test]
    fn halves_are_page_aligned() {
        assert_eq!(bitmap_len(1, 4096), 8192);
        assert_eq!(bitmap_len(0x8000, 4096), 8192);
        assert_eq!(bitmap_len(0x8001, 4096), 16384);
    }

    #[test]
    fn handles_share_contents() {
        let store = BitmapStore::new(0x10000, 4096).unwrap();
        let mut a = store.bitmaps().unwrap();
        a.second.set(0x9000, true).unwrap();
        a.flush().unwrap();

        let mut b = store.bitmaps().unwrap();
        assert!(b.second.get(0x9000).unwrap());
        assert!(!b.first.get(0x9000).unwrap());
    }
}

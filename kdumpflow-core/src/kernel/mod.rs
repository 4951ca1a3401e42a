/*!
Knowledge about the crashed kernel: its structure layouts, page descriptor
arrays, memory zones and the rules used to classify its pages.
*/

pub mod layout;
pub use layout::{LayoutTable, StructView};

pub mod page;
pub use page::{PageDescriptor, PageFlagBits, PageLayout, PGMM_CACHED};

pub mod classify;
pub use classify::{BuddyDetect, Classifier, PageClass, Verdict};

pub mod zone;
pub use zone::{FreeAreaLayout, ZoneInfo};

pub mod freelist;
pub use freelist::{FreeListScanner, FreeListStats};

use std::fmt;

use log::info;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::MemMapTable;

/// Length of each `new_utsname` string field.
pub const UTSNAME_FIELD_LEN: usize = 65;

/// The kernel's `struct new_utsname`.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Utsname {
    pub sysname: [u8; UTSNAME_FIELD_LEN],
    pub nodename: [u8; UTSNAME_FIELD_LEN],
    pub release: [u8; UTSNAME_FIELD_LEN],
    pub version: [u8; UTSNAME_FIELD_LEN],
    pub machine: [u8; UTSNAME_FIELD_LEN],
    pub domainname: [u8; UTSNAME_FIELD_LEN],
}

unsafe impl dataview::Pod for Utsname {}

impl Default for Utsname {
    fn default() -> Self {
        Self {
            sysname: [0; UTSNAME_FIELD_LEN],
            nodename: [0; UTSNAME_FIELD_LEN],
            release: [0; UTSNAME_FIELD_LEN],
            version: [0; UTSNAME_FIELD_LEN],
            machine: [0; UTSNAME_FIELD_LEN],
            domainname: [0; UTSNAME_FIELD_LEN],
        }
    }
}

impl Utsname {
    /// A name carrying only `sysname` and `release`.
    pub fn with_release(release: &str) -> Self {
        let mut uts = Self::default();
        copy_field(&mut uts.sysname, "Linux");
        copy_field(&mut uts.release, release);
        uts
    }

    pub fn field_str(field: &[u8; UTSNAME_FIELD_LEN]) -> &str {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        std::str::from_utf8(&field[..end]).unwrap_or("")
    }
}

fn copy_field(field: &mut [u8; UTSNAME_FIELD_LEN], value: &str) {
    let len = value.len().min(UTSNAME_FIELD_LEN - 1);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

impl fmt::Debug for Utsname {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Utsname")
            .field("sysname", &Self::field_str(&self.sysname))
            .field("nodename", &Self::field_str(&self.nodename))
            .field("release", &Self::field_str(&self.release))
            .field("version", &Self::field_str(&self.version))
            .field("machine", &Self::field_str(&self.machine))
            .finish()
    }
}

/// Everything the page filter needs to know about the crashed kernel.
#[derive(Clone, Debug)]
pub struct KernelContext {
    pub table: LayoutTable,
    pub mem_map: MemMapTable,
    pub zones: Vec<ZoneInfo>,
    pub utsname: Utsname,
    page: Option<PageLayout>,
    free_area: Option<FreeAreaLayout>,
    buddy: BuddyDetect,
}

impl KernelContext {
    /// Resolves the page and free area layouts that `table` supports.
    ///
    /// Missing layout entries only become errors once a dump level needs them.
    pub fn new(table: LayoutTable, mem_map: MemMapTable, zones: Vec<ZoneInfo>) -> Self {
        let page = PageLayout::from_table(&table).ok();
        let free_area = FreeAreaLayout::from_table(&table).ok();
        let buddy = page
            .as_ref()
            .map(|p| BuddyDetect::from_table(&table, p))
            .unwrap_or(BuddyDetect::None);
        info!(
            "kernel layout: page descriptors {}, free lists {}, buddy detection {:?}",
            if page.is_some() { "resolved" } else { "unavailable" },
            if free_area.is_some() { "resolved" } else { "unavailable" },
            buddy
        );
        let utsname = Utsname::with_release(table.osrelease().unwrap_or(""));
        Self {
            table,
            mem_map,
            zones,
            utsname,
            page,
            free_area,
            buddy,
        }
    }

    pub fn with_utsname(mut self, utsname: Utsname) -> Self {
        self.utsname = utsname;
        self
    }

    pub fn page_layout(&self) -> Result<&PageLayout> {
        self.page.as_ref().ok_or_else(|| {
            Error(ErrorOrigin::Layout, ErrorKind::MissingLayout)
                .log_error("the kernel does not describe struct page")
        })
    }

    pub fn free_area_layout(&self) -> Result<&FreeAreaLayout> {
        self.free_area.as_ref().ok_or_else(|| {
            Error(ErrorOrigin::Layout, ErrorKind::MissingLayout)
                .log_error("the kernel does not describe its free areas")
        })
    }

    pub fn buddy(&self) -> BuddyDetect {
        self.buddy
    }
}

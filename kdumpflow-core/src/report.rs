/*!
Per-category page counts and the summary printed after a dump.
*/

use std::fmt;
use std::ops::AddAssign;

use crate::kernel::PageClass;
use crate::types::Pfn;

/// Pages excluded per category during one pass over the address space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExclusionCounters {
    pub zero: u64,
    pub cache: u64,
    pub cache_private: u64,
    pub user: u64,
    pub free: u64,
    pub hwpoison: u64,
    pub memhole: u64,
}

impl ExclusionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, class: PageClass, pages: u64) {
        match class {
            PageClass::Zero => self.zero += pages,
            PageClass::Cache => self.cache += pages,
            PageClass::CachePrivate => self.cache_private += pages,
            PageClass::UserData => self.user += pages,
            PageClass::Free => self.free += pages,
            PageClass::HwPoison => self.hwpoison += pages,
        }
    }

    /// Excluded pages over all categories, holes not included.
    pub fn excluded(&self) -> u64 {
        self.zero + self.cache + self.cache_private + self.user + self.free + self.hwpoison
    }
}

impl AddAssign for ExclusionCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.zero += rhs.zero;
        self.cache += rhs.cache;
        self.cache_private += rhs.cache_private;
        self.user += rhs.user;
        self.free += rhs.free;
        self.hwpoison += rhs.hwpoison;
        self.memhole += rhs.memhole;
    }
}

/// The final summary of a dump or mem-usage run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DumpReport {
    pub max_mapnr: Pfn,
    pub page_size: u64,
    pub counters: ExclusionCounters,
}

impl DumpReport {
    pub fn new(max_mapnr: Pfn, page_size: u64, counters: ExclusionCounters) -> Self {
        Self {
            max_mapnr,
            page_size,
            counters,
        }
    }

    /// Pages present in the source image.
    pub fn original_pages(&self) -> u64 {
        self.max_mapnr.saturating_sub(self.counters.memhole)
    }

    pub fn remaining_pages(&self) -> u64 {
        self.original_pages().saturating_sub(self.counters.excluded())
    }

    pub fn shrink_percent(&self) -> f64 {
        match self.original_pages() {
            0 => 0.0,
            orig => self.counters.excluded() as f64 * 100.0 / orig as f64,
        }
    }

    /// Mem-usage rendering: one line per category with page count and bytes.
    pub fn mem_usage(&self) -> MemUsage<'_> {
        MemUsage(self)
    }
}

impl fmt::Display for DumpReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c = &self.counters;
        writeln!(f, "Original pages  : 0x{:016x}", self.original_pages())?;
        writeln!(f, "  Excluded pages   : 0x{:016x}", c.excluded())?;
        writeln!(f, "    Pages filled with zero  : 0x{:016x}", c.zero)?;
        writeln!(f, "    Non-private cache pages : 0x{:016x}", c.cache)?;
        writeln!(f, "    Private cache pages     : 0x{:016x}", c.cache_private)?;
        writeln!(f, "    User process data pages : 0x{:016x}", c.user)?;
        writeln!(f, "    Free pages              : 0x{:016x}", c.free)?;
        writeln!(f, "    Hwpoison pages          : 0x{:016x}", c.hwpoison)?;
        writeln!(f, "  Remaining pages  : 0x{:016x}", self.remaining_pages())?;
        writeln!(f, "  (The number of pages is reduced to {:.0}%.)", 100.0 - self.shrink_percent())?;
        writeln!(f, "Memory Hole     : 0x{:016x}", c.memhole)?;
        write!(f, "--------------------------------------------------\nTotal pages     : 0x{:016x}", self.max_mapnr)
    }
}

pub struct MemUsage<'a>(&'a DumpReport);

impl<'a> fmt::Display for MemUsage<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let r = self.0;
        let c = &r.counters;
        let rows = [
            ("ZERO", c.zero),
            ("NON_PRI_CACHE", c.cache),
            ("PRI_CACHE", c.cache_private),
            ("USER", c.user),
            ("FREE", c.free),
            ("HWPOISON", c.hwpoison),
            ("KERN_DATA", r.remaining_pages()),
        ];
        writeln!(f, "TYPE            PAGES                   EXCLUDABLE  DESCRIPTION")?;
        writeln!(f, "----------------------------------------------------------------------")?;
        for (i, (name, pages)) in rows.iter().enumerate() {
            let excludable = if *name == "KERN_DATA" { "no " } else { "yes" };
            writeln!(
                f,
                "{:<16}{:<24}{:<12}{}",
                name,
                pages,
                excludable,
                DESCRIPTIONS[i]
            )?;
        }
        writeln!(f)?;
        writeln!(f, "page size:              {}", r.page_size)?;
        writeln!(f, "Total pages on system:  {}", r.original_pages())?;
        write!(f, "Total size on system:   {} Byte", r.original_pages() * r.page_size)
    }
}

const DESCRIPTIONS: [&str; 7] = [
    "Pages filled with zero",
    "Cache pages without private flag",
    "Cache pages with private flag",
    "User process pages",
    "Free pages",
    "Hardware poisoned pages",
    "Dumpable kernel data",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals() {
        let mut c = ExclusionCounters::new();
        c.add(PageClass::Cache, 10);
        c.add(PageClass::Free, 30);
        c.memhole = 100;
        let mut other = ExclusionCounters::new();
        other.add(PageClass::Zero, 10);
        c += other;

        let report = DumpReport::new(300, 4096, c);
        assert_eq!(report.original_pages(), 200);
        assert_eq!(report.remaining_pages(), 150);
        assert!((report.shrink_percent() - 25.0).abs() < 1e-9);

        let text = report.to_string();
        assert!(text.contains("Memory Hole     : 0x0000000000000064"));
        assert!(text.contains("Total pages     : 0x000000000000012c"));
        assert!(report.mem_usage().to_string().contains("KERN_DATA       150"));
    }
}

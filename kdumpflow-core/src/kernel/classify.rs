/*!
Page classification.

Every decision is a pure function of one decoded descriptor, its frame
number and the configured dump level.
*/

use crate::types::{DumpLevel, Pfn};

use super::layout::LayoutTable;
use super::page::{is_valid_order, PageDescriptor, PageLayout};

/// Categories a page can be excluded under.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PageClass {
    Zero,
    Cache,
    CachePrivate,
    UserData,
    Free,
    HwPoison,
}

/// Outcome of classifying a page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    /// Exclude `nr_pages` frames starting at the classified one.
    Exclude { class: PageClass, nr_pages: u64 },
}

/// Strategy used to recognise pages owned by the buddy allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuddyDetect {
    /// Free pages are found by walking the zone free lists instead.
    None,
    /// A dedicated `PG_buddy` flag bit.
    FlagBit(u64),
    /// `_mapcount` holds a sentinel value on pages that are not slab pages.
    MapcountValue { value: u32, slab: u64 },
}

impl BuddyDetect {
    /// Selects the detection strategy supported by the kernel layout.
    pub fn from_table(table: &LayoutTable, layout: &PageLayout) -> Self {
        if !layout.has_private() {
            return BuddyDetect::None;
        }
        if let Some(bit) = table.number("PG_buddy") {
            return BuddyDetect::FlagBit(1 << bit);
        }
        match table.number("PAGE_BUDDY_MAPCOUNT_VALUE") {
            Some(value) if layout.has_mapcount() => BuddyDetect::MapcountValue {
                value: value as i32 as u32,
                slab: layout.flags.slab,
            },
            _ => BuddyDetect::None,
        }
    }

    pub fn is_buddy(&self, d: &PageDescriptor) -> bool {
        match *self {
            BuddyDetect::None => false,
            BuddyDetect::FlagBit(mask) => d.flags & mask != 0,
            BuddyDetect::MapcountValue { value, slab } => d.flags & slab == 0 && d.mapcount == value,
        }
    }
}

/// Applies the exclusion rules enabled by a dump level.
#[derive(Clone, Debug)]
pub struct Classifier<'a> {
    layout: &'a PageLayout,
    level: DumpLevel,
    buddy: BuddyDetect,
}

impl<'a> Classifier<'a> {
    pub fn new(layout: &'a PageLayout, level: DumpLevel, buddy: BuddyDetect) -> Self {
        Self {
            layout,
            level,
            buddy,
        }
    }

    /// Returns true if free pages have to be found through the free lists.
    pub fn needs_free_list_walk(&self) -> bool {
        self.level.contains(DumpLevel::FREE) && self.buddy == BuddyDetect::None
    }

    /// Classifies the page at `pfn`.
    ///
    /// Rules are checked in order and the first match wins: buddy free
    /// block, cache page without private data, cache page with private
    /// data, user data (anonymous or hugetlbfs), hardware poisoned page.
    /// Hardware poisoned pages are dropped regardless of the dump level.
    pub fn classify(&self, pfn: Pfn, d: &PageDescriptor) -> Verdict {
        let l = self.layout;
        let compound = 1u64 << d.compound_order;
        let cached = l.is_lru(d) || l.is_swapcache(d);

        let (class, nr_pages) = if self.level.contains(DumpLevel::FREE) && self.buddy.is_buddy(d) {
            let nr_pages = if is_valid_order(pfn, d.private, l.word_size) {
                1u64 << d.private
            } else {
                1
            };
            (PageClass::Free, nr_pages)
        } else if self.level.contains(DumpLevel::CACHE)
            && cached
            && !l.is_private(d)
            && !l.is_anon(d)
        {
            (PageClass::Cache, compound)
        } else if self.level.contains(DumpLevel::CACHE_PRIVATE) && cached && !l.is_anon(d) {
            (PageClass::CachePrivate, compound)
        } else if self.level.contains(DumpLevel::USER_DATA) && (l.is_anon(d) || l.is_hugetlb(d)) {
            (PageClass::UserData, compound)
        } else if l.is_hwpoison(d) {
            (PageClass::HwPoison, compound)
        } else {
            return Verdict::Keep;
        };

        Verdict::Exclude { class, nr_pages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PG_LRU: u64 = 1 << 5;
    const PG_SLAB: u64 = 1 << 7;
    const PG_PRIVATE: u64 = 1 << 11;
    const PG_HWPOISON: u64 = 1 << 20;

    fn table() -> LayoutTable {
        LayoutTable::new()
            .with_size("page", 64)
            .with_offset("page.flags", 0)
            .with_offset("page._count", 28)
            .with_offset("page._mapcount", 24)
            .with_offset("page.mapping", 8)
            .with_offset("page.private", 16)
            .with_offset("page.lru", 32)
            .with_offset("list_head.next", 0)
            .with_offset("list_head.prev", 8)
            .with_number("PG_hwpoison", 20)
            .with_number("PAGE_BUDDY_MAPCOUNT_VALUE", -128)
    }

    fn desc(flags: u64, mapping: u64) -> PageDescriptor {
        PageDescriptor {
            flags,
            mapping,
            ..Default::default()
        }
    }

    fn buddy(order: u64) -> PageDescriptor {
        PageDescriptor {
            mapcount: -128i32 as u32,
            private: order,
            ..Default::default()
        }
    }

    #[test]
    fn selects_mapcount_buddy() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        assert_eq!(
            BuddyDetect::from_table(&t, &l),
            BuddyDetect::MapcountValue {
                value: -128i32 as u32,
                slab: PG_SLAB
            }
        );
        let t = t.with_number("PG_buddy", 19);
        assert_eq!(BuddyDetect::from_table(&t, &l), BuddyDetect::FlagBit(1 << 19));
    }

    #[test]
    fn slab_page_is_never_buddy() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        let b = BuddyDetect::from_table(&t, &l);
        let mut d = buddy(0);
        assert!(b.is_buddy(&d));
        d.flags |= PG_SLAB;
        assert!(!b.is_buddy(&d));
    }

    #[test]
    fn rule_order() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        let c = Classifier::new(&l, DumpLevel::all(), BuddyDetect::from_table(&t, &l));

        assert_eq!(
            c.classify(0, &desc(PG_LRU, 0)),
            Verdict::Exclude {
                class: PageClass::Cache,
                nr_pages: 1
            }
        );
        assert_eq!(
            c.classify(0, &desc(PG_LRU | PG_PRIVATE, 0)),
            Verdict::Exclude {
                class: PageClass::CachePrivate,
                nr_pages: 1
            }
        );
        assert_eq!(
            c.classify(0, &desc(PG_LRU, 0x1)),
            Verdict::Exclude {
                class: PageClass::UserData,
                nr_pages: 1
            }
        );
        assert_eq!(
            c.classify(0, &desc(PG_HWPOISON, 0)),
            Verdict::Exclude {
                class: PageClass::HwPoison,
                nr_pages: 1
            }
        );
        assert_eq!(c.classify(0, &desc(0, 0)), Verdict::Keep);
    }

    #[test]
    fn disabled_categories_fall_through() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        let c = Classifier::new(&l, DumpLevel::CACHE_PRIVATE, BuddyDetect::from_table(&t, &l));
        // without CACHE the clean cache page lands in the private bucket
        assert_eq!(
            c.classify(0, &desc(PG_LRU, 0)),
            Verdict::Exclude {
                class: PageClass::CachePrivate,
                nr_pages: 1
            }
        );
        assert_eq!(c.classify(0, &buddy(3)), Verdict::Keep);

        let c = Classifier::new(&l, DumpLevel::empty(), BuddyDetect::None);
        assert_eq!(
            c.classify(0, &desc(PG_HWPOISON | PG_LRU, 0)),
            Verdict::Exclude {
                class: PageClass::HwPoison,
                nr_pages: 1
            }
        );
    }

    #[test]
    fn buddy_run_length() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        let c = Classifier::new(&l, DumpLevel::FREE, BuddyDetect::from_table(&t, &l));
        assert_eq!(
            c.classify(0x40, &buddy(3)),
            Verdict::Exclude {
                class: PageClass::Free,
                nr_pages: 8
            }
        );
        assert_eq!(
            c.classify(0x41, &buddy(3)),
            Verdict::Exclude {
                class: PageClass::Free,
                nr_pages: 1
            }
        );
    }

    #[test]
    fn classification_is_repeatable() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        let c = Classifier::new(&l, DumpLevel::all(), BuddyDetect::from_table(&t, &l));
        let d = PageDescriptor {
            flags: PG_LRU,
            compound_order: 2,
            ..Default::default()
        };
        assert_eq!(c.classify(8, &d), c.classify(8, &d));
    }

    #[test]
    fn free_list_walk_needed_without_buddy_detection() {
        let t = table();
        let l = PageLayout::from_table(&t).unwrap();
        assert!(Classifier::new(&l, DumpLevel::FREE, BuddyDetect::None).needs_free_list_walk());
        assert!(!Classifier::new(&l, DumpLevel::CACHE, BuddyDetect::None).needs_free_list_walk());
    }
}

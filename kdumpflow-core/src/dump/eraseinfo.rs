/*!
Erasing kernel data from the dump and recording what was erased.
*/

use std::fmt::Write as _;

use log::debug;

/// How much memory an erase entry covers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseSize {
    Bytes(u64),
    /// A pointer sized field, set to null.
    Nullify,
}

/// One resolved erase request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EraseEntry {
    pub symbol: String,
    pub paddr: u64,
    pub size: EraseSize,
}

impl EraseEntry {
    pub fn new(symbol: &str, paddr: u64, size: EraseSize) -> Self {
        Self {
            symbol: symbol.to_string(),
            paddr,
            size,
        }
    }

    fn len(&self, word_size: u64) -> u64 {
        match self.size {
            EraseSize::Bytes(n) => n,
            EraseSize::Nullify => word_size,
        }
    }
}

/// Zeroes erased ranges in page data and renders the eraseinfo text.
#[derive(Clone, Debug, Default)]
pub struct EraseFilter {
    entries: Vec<EraseEntry>,
    word_size: u64,
}

impl EraseFilter {
    pub fn new(entries: Vec<EraseEntry>, word_size: u64) -> Self {
        Self { entries, word_size }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[EraseEntry] {
        &self.entries
    }

    /// Clears the erased bytes of `buf`, which holds memory starting at `paddr`.
    pub fn apply(&self, paddr: u64, buf: &mut [u8]) {
        let end = paddr + buf.len() as u64;
        for entry in self.entries.iter() {
            let start = entry.paddr.max(paddr);
            let stop = (entry.paddr + entry.len(self.word_size)).min(end);
            if start < stop {
                debug!("erasing {} bytes of {} at {:x}", stop - start, entry.symbol, start);
                buf[(start - paddr) as usize..(stop - paddr) as usize]
                    .iter_mut()
                    .for_each(|b| *b = 0);
            }
        }
    }

    /// The eraseinfo section, one line per entry.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.iter() {
            // writing to a String cannot fail
            let _ = match entry.size {
                EraseSize::Bytes(n) => writeln!(out, "erase {} size {}", entry.symbol, n),
                EraseSize::Nullify => writeln!(out, "erase {} nullify", entry.symbol),
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> EraseFilter {
        EraseFilter::new(
            vec![
                EraseEntry::new("secret_key", 0x1ff8, EraseSize::Bytes(16)),
                EraseEntry::new("init_task.cred", 0x3000, EraseSize::Nullify),
            ],
            8,
        )
    }

    #[test]
    fn erases_across_page_boundary() {
        let f = filter();
        let mut page = vec![0xffu8; 0x1000];
        f.apply(0x1000, &mut page);
        assert!(page[0xff8..].iter().all(|&b| b == 0));
        assert_eq!(page[0xff7], 0xff);

        let mut page = vec![0xffu8; 0x1000];
        f.apply(0x2000, &mut page);
        assert!(page[..8].iter().all(|&b| b == 0));
        assert_eq!(page[8], 0xff);

        let mut page = vec![0xffu8; 0x1000];
        f.apply(0x3000, &mut page);
        assert!(page[..8].iter().all(|&b| b == 0));
        assert_eq!(page[8], 0xff);
    }

    #[test]
    fn text_lines() {
        assert_eq!(
            filter().text(),
            "erase secret_key size 16\nerase init_task.cred nullify\n"
        );
        assert!(EraseFilter::default().text().is_empty());
    }
}

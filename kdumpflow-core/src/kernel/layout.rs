/*!
Symbol addresses, structure sizes, field offsets and numeric constants of the
crashed kernel, as exported in its VMCOREINFO note.

All lookups are by name, so structure layouts that differ between kernel
builds are handled without recompiling.
*/

use std::fmt;

use hashbrown::HashMap;
use log::debug;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

/// A named table of kernel layout facts.
#[derive(Clone, Debug, Default)]
pub struct LayoutTable {
    symbols: HashMap<String, u64>,
    sizes: HashMap<String, u64>,
    offsets: HashMap<String, u64>,
    numbers: HashMap<String, i64>,
    lengths: HashMap<String, u64>,
    values: HashMap<String, String>,
    word_size: Option<u64>,
}

impl LayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the `KEY=value` lines of a VMCOREINFO note.
    ///
    /// Symbol addresses and `KERNELOFFSET` are hexadecimal, every other
    /// numeric entry is decimal. Unknown plain keys are kept as strings.
    pub fn parse_vmcoreinfo(text: &str) -> Result<Self> {
        let mut table = Self::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = match line.split_once('=') {
                Some(kv) => kv,
                None => {
                    debug!("skipping vmcoreinfo line without value: {}", line);
                    continue;
                }
            };

            if let Some(name) = strip_entry(key, "SYMBOL") {
                table.symbols.insert(name.to_string(), parse_hex(line, value)?);
            } else if let Some(name) = strip_entry(key, "SIZE") {
                table.sizes.insert(name.to_string(), parse_dec(line, value)?);
            } else if let Some(name) = strip_entry(key, "OFFSET") {
                table.offsets.insert(name.to_string(), parse_dec(line, value)?);
            } else if let Some(name) = strip_entry(key, "LENGTH") {
                table.lengths.insert(name.to_string(), parse_dec(line, value)?);
            } else if let Some(name) = strip_entry(key, "NUMBER") {
                let number = value.trim().parse::<i64>().map_err(|_| {
                    Error(ErrorOrigin::Layout, ErrorKind::Encoding).log_error(line)
                })?;
                table.numbers.insert(name.to_string(), number);
            } else {
                table.values.insert(key.to_string(), value.trim().to_string());
            }
        }
        Ok(table)
    }

    pub fn with_symbol(mut self, name: &str, addr: u64) -> Self {
        self.symbols.insert(name.to_string(), addr);
        self
    }

    pub fn with_size(mut self, name: &str, size: u64) -> Self {
        self.sizes.insert(name.to_string(), size);
        self
    }

    pub fn with_offset(mut self, name: &str, offset: u64) -> Self {
        self.offsets.insert(name.to_string(), offset);
        self
    }

    pub fn with_number(mut self, name: &str, number: i64) -> Self {
        self.numbers.insert(name.to_string(), number);
        self
    }

    pub fn with_length(mut self, name: &str, length: u64) -> Self {
        self.lengths.insert(name.to_string(), length);
        self
    }

    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_word_size(mut self, word_size: u64) -> Self {
        self.word_size = Some(word_size);
        self
    }

    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    pub fn size(&self, name: &str) -> Option<u64> {
        self.sizes.get(name).copied()
    }

    /// Offset of a structure member, keyed as `struct.member`.
    pub fn offset(&self, name: &str) -> Option<u64> {
        self.offsets.get(name).copied()
    }

    pub fn number(&self, name: &str) -> Option<i64> {
        self.numbers.get(name).copied()
    }

    pub fn length(&self, name: &str) -> Option<u64> {
        self.lengths.get(name).copied()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Width of the kernel's `unsigned long`.
    pub fn word_size(&self) -> u64 {
        self.word_size.unwrap_or(8)
    }

    /// Page size recorded by the kernel, if present.
    pub fn page_size(&self) -> Option<u64> {
        self.value("PAGESIZE").and_then(|v| v.parse().ok())
    }

    pub fn osrelease(&self) -> Option<&str> {
        self.value("OSRELEASE")
    }

    pub fn require_symbol(&self, name: &str) -> Result<u64> {
        self.symbol(name)
            .ok_or_else(|| Error(ErrorOrigin::Layout, ErrorKind::MissingSymbol).log_debug(name))
    }

    pub fn require_size(&self, name: &str) -> Result<u64> {
        self.size(name)
            .ok_or_else(|| Error(ErrorOrigin::Layout, ErrorKind::MissingLayout).log_debug(format!("SIZE({})", name)))
    }

    pub fn require_offset(&self, name: &str) -> Result<u64> {
        self.offset(name).ok_or_else(|| {
            Error(ErrorOrigin::Layout, ErrorKind::MissingLayout).log_debug(format!("OFFSET({})", name))
        })
    }

    pub fn require_number(&self, name: &str) -> Result<i64> {
        self.number(name).ok_or_else(|| {
            Error(ErrorOrigin::Layout, ErrorKind::MissingLayout).log_debug(format!("NUMBER({})", name))
        })
    }

    /// Returns a view of `bytes` interpreted as an instance of structure `name`.
    pub fn view<'a>(&'a self, name: &'a str, bytes: &'a [u8]) -> StructView<'a> {
        StructView {
            table: self,
            name,
            bytes,
        }
    }
}

fn strip_entry<'a>(key: &'a str, kind: &str) -> Option<&'a str> {
    key.strip_prefix(kind)?.strip_prefix('(')?.strip_suffix(')')
}

fn parse_hex(line: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let value = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(value, 16)
        .map_err(|_| Error(ErrorOrigin::Layout, ErrorKind::Encoding).log_error(line))
}

fn parse_dec(line: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| Error(ErrorOrigin::Layout, ErrorKind::Encoding).log_error(line))
}

/// A byte buffer holding one kernel structure whose member offsets are
/// resolved through a [`LayoutTable`].
#[derive(Copy, Clone)]
pub struct StructView<'a> {
    table: &'a LayoutTable,
    name: &'a str,
    bytes: &'a [u8],
}

impl<'a> StructView<'a> {
    fn field(&self, member: &str, width: usize) -> Result<&'a [u8]> {
        let key = format!("{}.{}", self.name, member);
        let offset = self.table.require_offset(&key)? as usize;
        self.bytes.get(offset..offset + width).ok_or_else(|| {
            Error(ErrorOrigin::Layout, ErrorKind::OutOfBounds).log_error(format!(
                "{} at {} exceeds {} bytes",
                key,
                offset,
                self.bytes.len()
            ))
        })
    }

    pub fn read_u8(&self, member: &str) -> Result<u8> {
        Ok(self.field(member, 1)?[0])
    }

    pub fn read_u32(&self, member: &str) -> Result<u32> {
        let b = self.field(member, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&self, member: &str) -> Result<i32> {
        self.read_u32(member).map(|v| v as i32)
    }

    pub fn read_u64(&self, member: &str) -> Result<u64> {
        let mut v = [0u8; 8];
        v.copy_from_slice(self.field(member, 8)?);
        Ok(u64::from_le_bytes(v))
    }

    /// Reads an `unsigned long` (or a pointer) member.
    pub fn read_ulong(&self, member: &str) -> Result<u64> {
        if self.table.word_size() == 4 {
            self.read_u32(member).map(u64::from)
        } else {
            self.read_u64(member)
        }
    }
}

impl<'a> fmt::Debug for StructView<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "struct {} ({} bytes)", self.name, self.bytes.len())
    }
}

/// Decodes a little endian `unsigned long` of `word_size` bytes at `offset`.
pub fn ulong_at(bytes: &[u8], offset: usize, word_size: u64) -> u64 {
    if word_size == 4 {
        uint_at(bytes, offset) as u64
    } else {
        let mut v = [0u8; 8];
        v.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(v)
    }
}

/// Decodes a little endian `unsigned int` at `offset`.
pub fn uint_at(bytes: &[u8], offset: usize) -> u32 {
    let mut v = [0u8; 4];
    v.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VMCOREINFO: &str = "OSRELEASE=6.1.0-test
PAGESIZE=4096
SYMBOL(node_data)=ffffffff82a1c660
SYMBOL(mem_section)=ffff88807ffd6000
SIZE(page)=64
SIZE(zone)=1600
OFFSET(page.flags)=0
OFFSET(page._refcount)=52
OFFSET(list_head.next)=0
LENGTH(zone.free_area)=11
NUMBER(PG_lru)=4
NUMBER(PAGE_BUDDY_MAPCOUNT_VALUE)=-129
KERNELOFFSET=1e000000
";

    #[test]
    fn parse_entries() {
        let table = LayoutTable::parse_vmcoreinfo(VMCOREINFO).unwrap();
        assert_eq!(table.osrelease(), Some("6.1.0-test"));
        assert_eq!(table.page_size(), Some(4096));
        assert_eq!(table.symbol("node_data"), Some(0xffff_ffff_82a1_c660));
        assert_eq!(table.size("page"), Some(64));
        assert_eq!(table.offset("page._refcount"), Some(52));
        assert_eq!(table.length("zone.free_area"), Some(11));
        assert_eq!(table.number("PAGE_BUDDY_MAPCOUNT_VALUE"), Some(-129));
        assert_eq!(table.value("KERNELOFFSET"), Some("1e000000"));
        assert_eq!(table.offset("page.mapping"), None);
        assert!(table.require_offset("page.mapping").is_err());
    }

    #[test]
    fn reject_garbage_number() {
        assert!(LayoutTable::parse_vmcoreinfo("SIZE(page)=sixty").is_err());
    }

    #[test]
    fn struct_view() {
        let table = LayoutTable::new()
            .with_offset("zone.spanned_pages", 8)
            .with_offset("zone.flags", 0)
            .with_offset("zone.tail", 14);
        let mut bytes = [0u8; 16];
        bytes[8..16].copy_from_slice(&0x1234u64.to_le_bytes());
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        let zone = table.view("zone", &bytes);
        assert_eq!(zone.read_ulong("spanned_pages").unwrap(), 0x1234);
        assert_eq!(zone.read_u32("flags").unwrap(), 7);
        assert!(zone.read_u64("tail").is_err());
        assert!(zone.read_u64("missing").is_err());
    }
}

/*!
Run configuration of a dump.

A [`DumpConfig`] is usually assembled from command line arguments, but can
also be loaded from a [TOML](https://toml.io/) file:

```toml
format = "compressed"
codecs = ["zlib"]
dump_levels = [31, 11, 1]
cyclic = { window = 0x8000 }

[[erase]]
symbol = "modprobe_path"
size = 256
```
*/

use std::path::PathBuf;

use log::debug;

use crate::cycle::pfn_cyclic_for;
use crate::dump::{Codec, EraseEntry, EraseFilter, EraseSize, DEFAULT_BLOCK_ORDER, PFN_EXCLUDED};
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::kernel::KernelContext;
use crate::mem::SourceMemory;
use crate::types::{roundup, DumpLevelList, Pfn};

/// Output container of a dump.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DumpFormat {
    Elf,
    Compressed,
}

/// How the bitmaps are held while filtering.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CyclicMode {
    /// Windows sized from the memory budget, whole-machine bitmaps in a
    /// scratch file when there is no budget.
    Auto,
    /// Whole-machine bitmaps in a scratch file.
    Full,
    /// Windows of a fixed number of page frames.
    Window(u64),
}

/// Bitmap strategy picked for one run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitmapMode {
    Full,
    Cyclic(u64),
}

/// An erase request as written in the configuration.
///
/// The address is either given directly or looked up from the kernel symbol.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EraseConfig {
    pub symbol: String,
    pub paddr: Option<u64>,
    pub size: Option<u64>,
    pub nullify: bool,
}

impl EraseConfig {
    pub fn resolve<S: SourceMemory>(&self, kernel: &KernelContext, source: &mut S) -> Result<EraseEntry> {
        let size = match (self.size, self.nullify) {
            (Some(n), false) if n > 0 => EraseSize::Bytes(n),
            (None, true) => EraseSize::Nullify,
            _ => {
                return Err(Error(ErrorOrigin::Config, ErrorKind::ArgValidation)
                    .log_error(format!("erase entry {} needs either a size or nullify", self.symbol)))
            }
        };
        let paddr = match self.paddr {
            Some(paddr) => paddr,
            None => {
                let vaddr = kernel.table.require_symbol(&self.symbol)?;
                source.virt_to_phys(vaddr)?
            }
        };
        debug!("erase {} at {:x}: {:?}", self.symbol, paddr, size);
        Ok(EraseEntry::new(&self.symbol, paddr, size))
    }
}

/// Everything that selects what a dump contains and how it is written.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DumpConfig {
    pub format: DumpFormat,
    /// Codecs tried for every page, in their fixed priority order.
    pub codecs: Vec<Codec>,
    /// Dump levels, tried in order when the output runs out of space.
    pub dump_levels: Vec<u32>,
    pub cyclic: CyclicMode,
    /// Memory available to the bitmaps, in bytes.
    pub mem_budget: Option<u64>,
    /// Shortest excluded run that starts a new PT_LOAD segment.
    pub elf_threshold: u64,
    /// Write cache size as a power of two of the page size.
    pub block_order: u32,
    pub flatten: bool,
    pub split: Vec<PathBuf>,
    pub erase: Vec<EraseConfig>,
    /// Directory for the scratch bitmap file.
    pub tmpdir: Option<PathBuf>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            format: DumpFormat::Compressed,
            codecs: Vec::new(),
            dump_levels: vec![0],
            cyclic: CyclicMode::Auto,
            mem_budget: None,
            elf_threshold: PFN_EXCLUDED,
            block_order: DEFAULT_BLOCK_ORDER,
            flatten: false,
            split: Vec::new(),
            erase: Vec::new(),
            tmpdir: None,
        }
    }
}

fn conflict(what: &str) -> Error {
    Error(ErrorOrigin::Config, ErrorKind::ConflictingOptions).log_error(what)
}

impl DumpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: DumpFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_codecs(mut self, codecs: &[Codec]) -> Self {
        self.codecs = codecs.to_vec();
        self
    }

    pub fn with_dump_levels(mut self, levels: &[u32]) -> Self {
        self.dump_levels = levels.to_vec();
        self
    }

    pub fn with_cyclic(mut self, cyclic: CyclicMode) -> Self {
        self.cyclic = cyclic;
        self
    }

    pub fn with_mem_budget(mut self, bytes: u64) -> Self {
        self.mem_budget = Some(bytes);
        self
    }

    pub fn with_elf_threshold(mut self, pages: u64) -> Self {
        self.elf_threshold = pages;
        self
    }

    pub fn with_flatten(mut self, flatten: bool) -> Self {
        self.flatten = flatten;
        self
    }

    pub fn with_split(mut self, files: Vec<PathBuf>) -> Self {
        self.split = files;
        self
    }

    pub fn with_erase(mut self, entry: EraseConfig) -> Self {
        self.erase.push(entry);
        self
    }

    /// Parses a configuration from TOML text.
    #[cfg(feature = "configfiles")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        ::toml::from_str(text).map_err(|e| {
            Error(ErrorOrigin::Config, ErrorKind::Configuration)
                .log_error(format!("unable to parse the configuration: {}", e))
        })
    }

    /// Loads a configuration file.
    #[cfg(feature = "configfiles")]
    pub fn open<P: AsRef<::std::path::Path>>(path: P) -> Result<Self> {
        let contents = ::std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::from_io(ErrorOrigin::Config, ErrorKind::UnableToReadFile, &e)
                .log_error(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Rejects option combinations no writer supports.
    pub fn validate(&self) -> Result<()> {
        self.dump_level_list()?;
        if self.format == DumpFormat::Elf {
            if !self.codecs.is_empty() {
                return Err(conflict("ELF output cannot be compressed"));
            }
            if !self.split.is_empty() {
                return Err(conflict("ELF output cannot be split"));
            }
        }
        if self.flatten && !self.split.is_empty() {
            return Err(conflict("flattened output cannot be split"));
        }
        if self.split.len() == 1 {
            return Err(Error(ErrorOrigin::Config, ErrorKind::ArgValidation)
                .log_error("a split dump needs at least two files"));
        }
        if self.elf_threshold == 0 {
            return Err(Error(ErrorOrigin::Config, ErrorKind::ArgValidation)
                .log_error("the ELF segment threshold must be positive"));
        }
        if self.cyclic == CyclicMode::Window(0) {
            return Err(Error(ErrorOrigin::Config, ErrorKind::ArgValidation)
                .log_error("the cyclic window must be positive"));
        }
        Ok(())
    }

    pub fn dump_level_list(&self) -> Result<DumpLevelList> {
        DumpLevelList::new(&self.dump_levels)
    }

    /// Number of output files.
    pub fn num_files(&self) -> u64 {
        self.split.len().max(1) as u64
    }

    /// Write cache size for pages of `page_size` bytes.
    pub fn cache_size(&self, page_size: u64) -> usize {
        (page_size as usize) << self.block_order
    }

    /// Chooses between whole-machine and windowed bitmaps for `max_mapnr`
    /// frames.
    pub fn bitmap_mode(&self, max_mapnr: Pfn) -> BitmapMode {
        match (self.cyclic, self.mem_budget) {
            (CyclicMode::Full, _) | (CyclicMode::Auto, None) => BitmapMode::Full,
            (CyclicMode::Window(pfns), _) => BitmapMode::Cyclic(roundup(pfns, 8)),
            (CyclicMode::Auto, Some(budget)) => {
                BitmapMode::Cyclic(pfn_cyclic_for(budget, max_mapnr, self.num_files()))
            }
        }
    }

    /// Resolves the configured erase entries against the crashed kernel.
    pub fn erase_filter<S: SourceMemory>(&self, kernel: &KernelContext, source: &mut S) -> Result<EraseFilter> {
        let entries = self
            .erase
            .iter()
            .map(|e| e.resolve(kernel, source))
            .collect::<Result<Vec<_>>>()?;
        Ok(EraseFilter::new(entries, kernel.table.word_size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::dummy::{DummyKernel, DUMMY_FREE_HUGE_PAGE, DUMMY_KERNEL_MAP};

    #[test]
    fn rejects_conflicts() {
        assert!(DumpConfig::new().validate().is_ok());
        let elf = DumpConfig::new().with_format(DumpFormat::Elf);
        assert!(elf.clone().validate().is_ok());
        assert_eq!(
            elf.clone().with_codecs(&[Codec::Zlib]).validate().unwrap_err().1,
            ErrorKind::ConflictingOptions
        );
        let files = vec![PathBuf::from("a"), PathBuf::from("b")];
        assert!(elf.with_split(files.clone()).validate().is_err());
        assert!(DumpConfig::new()
            .with_flatten(true)
            .with_split(files.clone())
            .validate()
            .is_err());
        assert!(DumpConfig::new().with_split(files).validate().is_ok());
    }

    #[test]
    fn rejects_bad_levels() {
        assert!(DumpConfig::new().with_dump_levels(&[]).validate().is_err());
        assert!(DumpConfig::new().with_dump_levels(&[31, 32]).validate().is_err());
        assert!(DumpConfig::new().with_dump_levels(&[1; 33]).validate().is_err());
        assert!(DumpConfig::new().with_dump_levels(&[31, 11, 1]).validate().is_ok());
    }

    #[test]
    fn bitmap_mode_selection() {
        assert_eq!(DumpConfig::new().bitmap_mode(0x10000), BitmapMode::Full);
        assert_eq!(
            DumpConfig::new().with_cyclic(CyclicMode::Window(13)).bitmap_mode(0x10000),
            BitmapMode::Cyclic(16)
        );
        assert_eq!(
            DumpConfig::new().with_mem_budget(1000).bitmap_mode(1 << 20),
            BitmapMode::Cyclic(6400)
        );
        assert_eq!(
            DumpConfig::new()
                .with_cyclic(CyclicMode::Full)
                .with_mem_budget(1000)
                .bitmap_mode(1 << 20),
            BitmapMode::Full
        );
    }

    #[test]
    fn erase_entries_resolve() {
        let mut dummy = DummyKernel::builder(0x10).build();
        let kernel = dummy.kernel().clone();
        let config = DumpConfig::new()
            .with_erase(EraseConfig {
                symbol: "free_huge_page".to_string(),
                nullify: true,
                ..EraseConfig::default()
            })
            .with_erase(EraseConfig {
                symbol: "secret".to_string(),
                paddr: Some(0x2000),
                size: Some(16),
                ..EraseConfig::default()
            });
        let filter = config.erase_filter(&kernel, &mut dummy).unwrap();
        assert_eq!(filter.entries()[0].paddr, DUMMY_FREE_HUGE_PAGE - DUMMY_KERNEL_MAP);
        assert_eq!(filter.entries()[0].size, EraseSize::Nullify);
        assert_eq!(filter.entries()[1].size, EraseSize::Bytes(16));

        let bad = DumpConfig::new().with_erase(EraseConfig {
            symbol: "free_huge_page".to_string(),
            ..EraseConfig::default()
        });
        assert!(bad.erase_filter(&kernel, &mut dummy).is_err());
    }

    #[cfg(feature = "configfiles")]
    #[test]
    fn load_toml() {
        let config = DumpConfig::from_toml_str(
            "
format = \"compressed\"
codecs = [\"zlib\", \"snappy\"]
dump_levels = [31, 11, 1]
cyclic = { window = 4096 }
flatten = true

[[erase]]
symbol = \"modprobe_path\"
size = 256",
        )
        .unwrap();
        assert_eq!(config.codecs, vec![Codec::Zlib, Codec::Snappy]);
        assert_eq!(config.cyclic, CyclicMode::Window(4096));
        assert_eq!(config.elf_threshold, PFN_EXCLUDED);
        assert_eq!(config.erase[0].size, Some(256));
        assert!(config.validate().is_ok());

        assert!(DumpConfig::from_toml_str("format = \"tar\"").is_err());
    }
}

/*!
Dump levels select which page categories are excluded from the output.
*/

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

/// Highest valid dump level (all exclusion bits set).
pub const MAX_DUMP_LEVEL: u32 = 31;

/// Maximum number of fallback levels accepted on a single command line.
pub const NUM_DUMP_LEVELS: usize = 32;

bitflags! {
    /// Page categories to exclude.
    pub struct DumpLevel: u32 {
        const ZERO = 0x01;
        const CACHE = 0x02;
        const CACHE_PRIVATE = 0x04;
        const USER_DATA = 0x08;
        const FREE = 0x10;
    }
}

impl DumpLevel {
    /// Converts a numeric dump level, rejecting values above 31.
    pub fn from_level(level: u32) -> Result<Self> {
        if level > MAX_DUMP_LEVEL {
            return Err(Error(ErrorOrigin::Args, ErrorKind::InvalidDumpLevel).log_error(level));
        }
        Ok(Self::from_bits_truncate(level))
    }

    /// Numeric representation as stored in the dump sub-header.
    pub fn level(self) -> u32 {
        self.bits()
    }

    /// Returns true if any category that requires reading page descriptors is enabled.
    pub fn needs_page_descriptors(self) -> bool {
        self.intersects(Self::CACHE | Self::CACHE_PRIVATE | Self::USER_DATA | Self::FREE)
    }
}

impl fmt::Display for DumpLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// An ordered list of fallback dump levels.
///
/// The first entry is tried first; when the output runs out of space the
/// next entry is selected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpLevelList {
    levels: SmallVec<[DumpLevel; 4]>,
    current: usize,
}

impl DumpLevelList {
    pub fn new(levels: &[u32]) -> Result<Self> {
        if levels.is_empty() {
            return Err(Error(ErrorOrigin::Args, ErrorKind::InvalidDumpLevel)
                .log_error("at least one dump level is required"));
        }
        if levels.len() > NUM_DUMP_LEVELS {
            return Err(Error(ErrorOrigin::Args, ErrorKind::InvalidDumpLevel)
                .log_error(format!("at most {} dump levels are allowed", NUM_DUMP_LEVELS)));
        }
        let levels = levels
            .iter()
            .map(|&l| DumpLevel::from_level(l))
            .collect::<Result<SmallVec<_>>>()?;
        Ok(Self { levels, current: 0 })
    }

    /// A list with a single level.
    pub fn single(level: DumpLevel) -> Self {
        let mut levels = SmallVec::new();
        levels.push(level);
        Self { levels, current: 0 }
    }

    /// The level in use.
    pub fn current(&self) -> DumpLevel {
        self.levels[self.current]
    }

    /// Index of the level in use.
    pub fn position(&self) -> usize {
        self.current
    }

    /// Advances to the next fallback level.
    ///
    /// Returns `None` once every level has been tried.
    pub fn advance(&mut self) -> Option<DumpLevel> {
        if self.current + 1 < self.levels.len() {
            self.current += 1;
            Some(self.current())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = DumpLevel> + '_ {
        self.levels.iter().copied()
    }
}

impl FromStr for DumpLevelList {
    type Err = Error;

    /// Parses the comma separated form, e.g. `31,11,1`.
    fn from_str(s: &str) -> Result<Self> {
        let levels = s
            .split(',')
            .map(|part| {
                part.trim().parse::<u32>().map_err(|_| {
                    Error(ErrorOrigin::Args, ErrorKind::InvalidDumpLevel).log_error(part)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(&levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fallback_list() {
        let mut list: DumpLevelList = "31,11,1".parse().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.current(), DumpLevel::all());
        assert_eq!(
            list.advance(),
            Some(DumpLevel::ZERO | DumpLevel::CACHE | DumpLevel::USER_DATA)
        );
        assert_eq!(list.advance(), Some(DumpLevel::ZERO));
        assert_eq!(list.advance(), None);
        assert_eq!(list.position(), 2);
    }

    #[test]
    fn reject_out_of_range() {
        assert!("32".parse::<DumpLevelList>().is_err());
        assert!("1,x".parse::<DumpLevelList>().is_err());
        assert!("".parse::<DumpLevelList>().is_err());
    }

    #[test]
    fn reject_too_many_levels() {
        let s = vec!["1"; NUM_DUMP_LEVELS + 1].join(",");
        assert!(s.parse::<DumpLevelList>().is_err());
        let s = vec!["1"; NUM_DUMP_LEVELS].join(",");
        assert!(s.parse::<DumpLevelList>().is_ok());
    }

    #[test]
    fn descriptor_categories() {
        assert!(!DumpLevel::ZERO.needs_page_descriptors());
        assert!(DumpLevel::FREE.needs_page_descriptors());
    }
}

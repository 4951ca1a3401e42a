use std::path::PathBuf;

use clap::ArgMatches;
use log::{info, warn};

use kdumpflow_core::*;

/// Parses `SYMBOL:SIZE` or `SYMBOL:nullify`.
pub fn parse_erase(arg: &str) -> Result<EraseConfig> {
    let invalid = || Error(ErrorOrigin::Args, ErrorKind::ArgValidation).log_error(format!("erase entry {}", arg));
    let (symbol, size) = arg.rsplit_once(':').ok_or_else(invalid)?;
    if symbol.is_empty() {
        return Err(invalid());
    }
    let mut entry = EraseConfig {
        symbol: symbol.to_string(),
        ..Default::default()
    };
    if size == "nullify" {
        entry.nullify = true;
    } else {
        entry.size = Some(size.parse().map_err(|_| invalid())?);
    }
    Ok(entry)
}

#[cfg(target_os = "linux")]
fn mem_free() -> Option<u64> {
    match procfs::Meminfo::new() {
        Ok(meminfo) => Some(meminfo.mem_free),
        Err(e) => {
            warn!("unable to read /proc/meminfo: {:?}", e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn mem_free() -> Option<u64> {
    None
}

/// Options of the filtering commands, on top of the `--config` file.
pub fn filter_config(matches: &ArgMatches) -> Result<DumpConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => DumpConfig::open(path)?,
        None => DumpConfig::new(),
    };

    if let Some(dir) = matches.get_one::<String>("tmpdir") {
        config.tmpdir = Some(PathBuf::from(dir));
    }
    if matches.get_flag("non-cyclic") {
        config.cyclic = CyclicMode::Full;
    }
    if let Some(&kb) = matches.get_one::<u64>("cyclic-buffer") {
        config.cyclic = CyclicMode::Window(kb * 1024 * 8);
    }

    if config.cyclic == CyclicMode::Auto && config.mem_budget.is_none() {
        config.mem_budget = mem_free();
        if let Some(free) = config.mem_budget {
            info!("{} bytes of free memory for the bitmaps", free);
        }
    }
    Ok(config)
}

/// Options of the commands writing a dump.
pub fn dump_config(matches: &ArgMatches) -> Result<DumpConfig> {
    let mut config = filter_config(matches)?;

    if let Some(levels) = matches.get_one::<String>("dump-level") {
        let list: DumpLevelList = levels.parse()?;
        config.dump_levels = list.iter().map(DumpLevel::level).collect();
    }

    let codecs = [("zlib", Codec::Zlib), ("lzo", Codec::Lzo), ("snappy", Codec::Snappy)]
        .iter()
        .filter(|(id, _)| matches.get_flag(id))
        .map(|&(_, codec)| codec)
        .collect::<Vec<_>>();
    if !codecs.is_empty() {
        config.codecs = codecs;
    }
    if matches.get_flag("elf") {
        if !config.codecs.is_empty() {
            return Err(Error(ErrorOrigin::Args, ErrorKind::ConflictingOptions)
                .log_error("ELF output cannot be compressed, the configuration selects codecs"));
        }
        config.format = DumpFormat::Elf;
    }

    if let Some(entries) = matches.get_many::<String>("erase") {
        for entry in entries {
            config.erase.push(parse_erase(entry)?);
        }
    }
    Ok(config)
}

/*!
Memory nodes, their zones and the kernel's name.
*/

use dataview::PodMethods;
use log::{debug, info};

use kdumpflow_core::error::Result;
use kdumpflow_core::kernel::{LayoutTable, Utsname, ZoneInfo};
use kdumpflow_core::mem::SourceMemory;

/// Zones when the kernel does not export `pglist_data.nr_zones`.
pub const DEFAULT_NR_ZONES: u64 = 4;

/// Offset of `name` in `struct uts_namespace` before it was exported.
pub const DEFAULT_UTS_NAME_OFFSET: u64 = 4;

/// Addresses of the `pglist_data` of every online node.
fn node_pgdats<S: SourceMemory>(source: &mut S, table: &LayoutTable) -> Result<Vec<(u32, u64)>> {
    let word = table.word_size();
    if let Some(node_data) = table.symbol("node_data") {
        let nr_nodes = table.length("node_data").unwrap_or(1);
        let online = match table.symbol("node_online_map") {
            Some(map) => source.virt_read_ulong(map, word)?,
            None => u64::MAX,
        };
        let mut pgdats = Vec::new();
        for node in 0..nr_nodes.min(word * 8) {
            if online & (1 << node) == 0 {
                continue;
            }
            let pgdat = source.virt_read_ulong(node_data + node * word, word)?;
            if pgdat != 0 {
                pgdats.push((node as u32, pgdat));
            }
        }
        Ok(pgdats)
    } else {
        Ok(vec![(0, table.require_symbol("contig_page_data")?)])
    }
}

/// Enumerates the populated zones of every node.
pub fn zones<S: SourceMemory>(source: &mut S, table: &LayoutTable) -> Result<Vec<ZoneInfo>> {
    let off_node_zones = table.require_offset("pglist_data.node_zones")?;
    let size_zone = table.require_size("zone")?;
    let off_spanned = table.require_offset("zone.spanned_pages")?;
    let word = table.word_size();

    let mut zones = Vec::new();
    for (node, pgdat) in node_pgdats(source, table)? {
        let nr_zones = match table.offset("pglist_data.nr_zones") {
            Some(off) => source.virt_read_u32(pgdat + off)? as u64,
            None => table.length("pglist_data.node_zones").unwrap_or(DEFAULT_NR_ZONES),
        };
        for index in 0..nr_zones {
            let address = pgdat + off_node_zones + index * size_zone;
            let spanned_pages = source.virt_read_ulong(address + off_spanned, word)?;
            if spanned_pages == 0 {
                continue;
            }
            debug!("node {} zone {} at {:x}: {:x} pages", node, index, address, spanned_pages);
            zones.push(ZoneInfo {
                node,
                index: index as u32,
                address,
                spanned_pages,
            });
        }
    }
    info!("{} populated zones", zones.len());
    Ok(zones)
}

/// Reads `init_uts_ns.name`.
pub fn utsname<S: SourceMemory>(source: &mut S, table: &LayoutTable) -> Result<Utsname> {
    let ns = table.require_symbol("init_uts_ns")?;
    let off = table.offset("uts_namespace.name").unwrap_or(DEFAULT_UTS_NAME_OFFSET);
    let mut uts = Utsname::default();
    source.virt_read_raw_into(ns + off, uts.as_bytes_mut())?;
    Ok(uts)
}

//! Host machine capacity
//!
//! Reads the logical processor count and a memory snapshot that a host
//! reports back with every session it creates. Memory figures come from
//! /proc/meminfo on Linux; elsewhere the snapshot is all zeros.

use crate::distributed::protocol::MemoryDetail;
use std::fs;

/// Number of logical processors visible to this process
///
/// Reads from /proc/cpuinfo or uses num_cpus crate as fallback.
pub fn logical_processors() -> usize {
    if let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") {
        let count = cpuinfo.lines()
            .filter(|line| line.starts_with("processor"))
            .count();
        if count > 0 {
            return count;
        }
    }

    num_cpus::get()
}

/// Current memory snapshot of this machine
pub fn memory_detail() -> MemoryDetail {
    fs::read_to_string("/proc/meminfo")
        .map(|meminfo| parse_meminfo(&meminfo))
        .unwrap_or_default()
}

/// Parse the contents of /proc/meminfo
///
/// Virtual memory is physical memory plus swap. Free physical memory
/// prefers `MemAvailable` (which counts reclaimable caches) over `MemFree`.
pub fn parse_meminfo(meminfo: &str) -> MemoryDetail {
    let mut total = 0u64;
    let mut free = None;
    let mut available = None;
    let mut swap_total = 0u64;
    let mut swap_free = 0u64;

    for line in meminfo.lines() {
        // MemTotal:       16318480 kB
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = kb,
            "MemFree:" => free = Some(kb),
            "MemAvailable:" => available = Some(kb),
            "SwapTotal:" => swap_total = kb,
            "SwapFree:" => swap_free = kb,
            _ => {}
        }
    }

    let free_physical = available.or(free).unwrap_or(0);
    MemoryDetail {
        total_visible_memory_kb: total,
        total_virtual_memory_kb: total + swap_total,
        free_physical_memory_kb: free_physical,
        free_virtual_memory_kb: free_physical + swap_free,
    }
}

//! NUMA placement for the calling thread: CPU affinity and memory policy.

use std::path::Path;

use syscalls::{Errno, Sysno, syscall};

use crate::pin_cpus;

const MPOL_DEFAULT: usize = 0;
const MPOL_PREFERRED: usize = 1;
const MPOL_BIND: usize = 2;
const MPOL_INTERLEAVE: usize = 3;
const MPOL_LOCAL: usize = 4;

const NODE_MASK_WORDS: usize = 16;
const NODE_MASK_BITS: usize = NODE_MASK_WORDS * u64::BITS as usize;

/// Parses a sysfs cpulist such as `0-15,32-47` into sorted, deduplicated ids.
pub fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut result = Vec::new();
    for part in s.trim().split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) =
                (start.trim().parse::<usize>(), end.trim().parse::<usize>())
            {
                result.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            result.push(cpu);
        }
    }
    result.sort_unstable();
    result.dedup();
    result
}

/// CPUs attached to `node`, read from `/sys/devices/system/node`.
pub fn node_cpus(node: u32) -> Result<Vec<usize>, Errno> {
    let path = Path::new("/sys/devices/system/node")
        .join(format!("node{node}"))
        .join("cpulist");
    let cpulist =
        std::fs::read_to_string(path).map_err(|_| Errno::new(libc::ENOENT))?;
    let cpus = parse_cpu_list(&cpulist);
    if cpus.is_empty() {
        return Err(Errno::new(libc::ENODEV));
    }
    Ok(cpus)
}

/// Restricts the calling thread to the CPUs of `node`.
pub fn run_on_node(node: u32) -> Result<(), Errno> {
    pin_cpus(&node_cpus(node)?)
}

/// Restricts future allocations of the calling thread to `node`.
pub fn bind_memory_to_node(node: u32) -> Result<(), Errno> {
    let node = node as usize;
    if node >= NODE_MASK_BITS {
        return Err(Errno::new(libc::EINVAL));
    }
    let mut mask = [0u64; NODE_MASK_WORDS];
    mask[node / 64] |= 1 << (node % 64);
    // The kernel reads maxnode - 1 bits.
    unsafe {
        syscall!(Sysno::set_mempolicy, MPOL_BIND, mask.as_ptr(), NODE_MASK_BITS + 1)
    }?;
    Ok(())
}

/// Describes the calling thread's memory policy, e.g. `bind:0` or `default`.
pub fn mem_policy_str() -> String {
    let mut mode: i32 = 0;
    let mut mask = [0u64; NODE_MASK_WORDS];
    let ret = unsafe {
        syscall!(
            Sysno::get_mempolicy,
            &mut mode as *mut i32,
            mask.as_mut_ptr(),
            NODE_MASK_BITS,
            0,
            0
        )
    };
    if let Err(e) = ret {
        return format!("unknown ({e})");
    }
    let name = match mode as usize {
        MPOL_DEFAULT => return "default".to_string(),
        MPOL_LOCAL => return "local".to_string(),
        MPOL_PREFERRED => "preferred",
        MPOL_BIND => "bind",
        MPOL_INTERLEAVE => "interleave",
        _ => "other",
    };
    let nodes: Vec<usize> = (0..NODE_MASK_BITS)
        .filter(|&bit| mask[bit / 64] & (1 << (bit % 64)) != 0)
        .collect();
    format!("{name}:{}", crate::format_cpu_list(&nodes))
}

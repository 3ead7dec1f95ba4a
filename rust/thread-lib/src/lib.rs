use libc::{CPU_ISSET, CPU_SET, CPU_SETSIZE, CPU_ZERO, cpu_set_t, pthread_self};
use syscalls::Errno;

mod numa;

pub use numa::{
    bind_memory_to_node, mem_policy_str, node_cpus, parse_cpu_list, run_on_node,
};

/// Restricts the calling thread to the given set of CPUs.
pub fn pin_cpus(cpus: &[usize]) -> Result<(), Errno> {
    if cpus.is_empty() {
        return Err(Errno::new(libc::EINVAL));
    }
    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut cpuset);
        for &cpu in cpus {
            if cpu >= CPU_SETSIZE as usize {
                return Err(Errno::new(libc::EINVAL));
            }
            CPU_SET(cpu, &mut cpuset);
        }
        let ret = libc::pthread_setaffinity_np(
            pthread_self(),
            size_of::<cpu_set_t>(),
            &cpuset,
        );
        if ret != 0 {
            return Err(Errno::new(ret));
        }
        Ok(())
    }
}

pub fn pin_cpu(cpu: usize) -> Result<(), Errno> {
    pin_cpus(&[cpu])
}

/// CPUs the calling thread may currently run on.
pub fn current_cpus() -> Result<Vec<usize>, Errno> {
    unsafe {
        let mut cpuset: cpu_set_t = std::mem::zeroed();
        let ret = libc::pthread_getaffinity_np(
            pthread_self(),
            size_of::<cpu_set_t>(),
            &mut cpuset,
        );
        if ret != 0 {
            return Err(Errno::new(ret));
        }
        Ok((0..CPU_SETSIZE as usize).filter(|&cpu| CPU_ISSET(cpu, &cpuset)).collect())
    }
}

/// Formats the calling thread's CPU mask as a compact range list, e.g. `0-7,16`.
pub fn cpu_mask_str() -> String {
    match current_cpus() {
        Ok(cpus) => format_cpu_list(&cpus),
        Err(e) => format!("unknown ({e})"),
    }
}

/// Inverse of [`parse_cpu_list`]. Input must be sorted.
pub fn format_cpu_list(cpus: &[usize]) -> String {
    let mut parts = Vec::new();
    let mut iter = cpus.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

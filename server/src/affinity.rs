//! CPU affinity utilities for pinning workers to NUMA nodes.

/// Pin the current thread to the CPUs of a NUMA node.
///
/// On Linux, resolves the node's CPU list from sysfs and applies it with
/// `sched_setaffinity`. On other platforms, this is a no-op.
#[cfg(target_os = "linux")]
pub fn pin_to_node(node: u32) -> Result<(), String> {
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    let cpulist = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
    let cpus = parse_cpu_list(cpulist.trim())?;
    set_cpu_affinity(&cpus)
}

/// Pin the current thread to a NUMA node (no-op on non-Linux platforms).
#[cfg(not(target_os = "linux"))]
pub fn pin_to_node(_node: u32) -> Result<(), String> {
    Ok(())
}

/// Set CPU affinity for the current thread to the given set of CPUs.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpus: &[usize]) -> Result<(), String> {
    use std::mem;

    if cpus.is_empty() {
        return Err("CPU set cannot be empty".to_string());
    }

    unsafe {
        let mut cpu_set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut cpu_set);
        }

        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set);

        if result == 0 {
            Ok(())
        } else {
            Err(format!(
                "sched_setaffinity failed with error code {}",
                result
            ))
        }
    }
}

/// Set CPU affinity for the current thread (no-op on non-Linux platforms).
#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpus: &[usize]) -> Result<(), String> {
    Ok(())
}

/// Parse a Linux-style CPU list string into a vector of CPU IDs.
pub fn parse_cpu_list(cpu_list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();

    for part in cpu_list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = part.split_once('-') {
            let start: usize = start_str
                .trim()
                .parse()
                .map_err(|_| format!("invalid start of range: {}", start_str))?;
            let end: usize = end_str
                .trim()
                .parse()
                .map_err(|_| format!("invalid end of range: {}", end_str))?;

            if start > end {
                return Err(format!("invalid range: start ({}) > end ({})", start, end));
            }

            for cpu in start..=end {
                cpus.push(cpu);
            }
        } else {
            let cpu: usize = part
                .parse()
                .map_err(|_| format!("invalid CPU number: {}", part))?;
            cpus.push(cpu);
        }
    }

    if cpus.is_empty() {
        return Err("CPU list cannot be empty".to_string());
    }

    cpus.sort_unstable();
    cpus.dedup();

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-7").unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(parse_cpu_list("1,3,8").unwrap(), vec![1, 3, 8]);
        assert_eq!(parse_cpu_list("0-2,5").unwrap(), vec![0, 1, 2, 5]);
        assert_eq!(parse_cpu_list("3,1,3").unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_parse_cpu_list_rejects_garbage() {
        assert!(parse_cpu_list("").is_err());
        assert!(parse_cpu_list("7-3").is_err());
        assert!(parse_cpu_list("abc").is_err());
    }
}

//! Host resource detection for the default advertisement.
//!
//! Names pinned in the `resources` flag win; anything missing is filled in
//! from the host, with headroom left for the agent itself: 1 GB of memory
//! when the host has more than 1 GB, 5 GB of disk when it has more than
//! 10 GB.

use std::path::Path;

use anyhow::Result;
use skiff_messages::Resources;
use tracing::warn;

const DEFAULT_CPUS: f64 = 1.0;
const DEFAULT_MEM_MB: f64 = 1024.0;
const DEFAULT_DISK_MB: f64 = 10240.0;

/// Builds the advertised resource vector from the flag plus host probes.
pub fn default_resources(flag: Option<&str>, work_dir: &Path) -> Result<Resources> {
    let mut resources = Resources::parse(flag.unwrap_or(""))?;

    if resources.cpus().is_none() {
        resources.set("cpus", detect_cpus());
    }

    if resources.mem().is_none() {
        resources.set("mem", detect_mem_mb());
    }

    if resources.disk().is_none() {
        resources.set("disk", detect_disk_mb(work_dir));
    }

    Ok(resources)
}

fn detect_cpus() -> f64 {
    let count = get_cpu_count();
    if count > 0 {
        count as f64
    } else {
        warn!("failed to detect cpu count, defaulting to {DEFAULT_CPUS}");
        DEFAULT_CPUS
    }
}

fn detect_mem_mb() -> f64 {
    let (total, _available) = get_memory_info();
    if total <= 0 {
        warn!("failed to detect memory size, defaulting to {DEFAULT_MEM_MB} MB");
        return DEFAULT_MEM_MB;
    }

    let mut mem = (total / (1024 * 1024)) as f64;
    // Keep 1 GB for the agent and the OS when there is room.
    if mem > 1024.0 {
        mem -= 1024.0;
    }
    mem
}

fn detect_disk_mb(work_dir: &Path) -> f64 {
    match available_disk_bytes(work_dir) {
        Ok(bytes) => {
            let mut disk = (bytes / (1024 * 1024)) as f64;
            // Keep 5 GB free when the volume is larger than 10 GB.
            if disk > 10.0 * 1024.0 {
                disk -= 5.0 * 1024.0;
            }
            disk
        }
        Err(e) => {
            warn!(error = %e, "failed to detect free disk space, defaulting to {DEFAULT_DISK_MB} MB");
            DEFAULT_DISK_MB
        }
    }
}

fn get_cpu_count() -> i32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as i32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as i32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (i64, i64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        let total = (page_size * total_pages) as i64;
        let avail = if avail_pages > 0 {
            (page_size * avail_pages) as i64
        } else {
            total
        };
        return (total, avail);
    }

    (0, 0)
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (i64, i64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size * total_pages) as i64;
            return (total, total / 2);
        }
    }

    (0, 0)
}

#[cfg(target_os = "linux")]
fn parse_meminfo(content: &str) -> (i64, i64) {
    let mut total: i64 = 0;
    let mut available: i64 = 0;
    let mut free: i64 = 0;
    let mut buffers: i64 = 0;
    let mut cached: i64 = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            const KB_TO_BYTES: i64 = 1024;
            let value: i64 = parts[1].parse().unwrap_or(0) * KB_TO_BYTES;
            match parts[0] {
                "MemTotal:" => total = value,
                "MemAvailable:" => available = value,
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

/// Fraction of the filesystem holding `path` that is in use, in `[0, 1]`.
pub fn disk_usage(path: &Path) -> Result<f64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let total = stat.blocks() as f64;
    if total <= 0.0 {
        anyhow::bail!("filesystem reports zero blocks for {}", path.display());
    }
    let available = stat.blocks_available() as f64;
    Ok(1.0 - available / total)
}

fn available_disk_bytes(path: &Path) -> Result<i64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok((stat.blocks_available() as i64) * (stat.fragment_size() as i64))
}

/// Advertised hostname, honoring the public-DNS override.
pub fn detect_hostname() -> Result<(String, String)> {
    let hostname = nix::unistd::gethostname()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("hostname is not valid UTF-8"))?;

    let public = std::env::var("SKIFF_PUBLIC_DNS").unwrap_or_else(|_| hostname.clone());
    Ok((hostname, public))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_fills_missing_names() {
        let r = default_resources(Some("cpus:2"), Path::new("/tmp")).unwrap();
        assert_eq!(r.cpus(), Some(2.0));
        assert!(r.mem().is_some());
        assert!(r.disk().is_some());
    }

    #[test]
    fn test_pinned_names_win() {
        let r = default_resources(Some("cpus:2;mem:512;disk:1024"), Path::new("/tmp")).unwrap();
        assert_eq!(r.cpus(), Some(2.0));
        assert_eq!(r.mem(), Some(512.0));
        assert_eq!(r.disk(), Some(1024.0));
    }

    #[test]
    fn test_get_cpu_count() {
        assert!(get_cpu_count() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_meminfo() {
        let sample = r#"MemTotal:       16384000 kB
MemFree:         1234567 kB
MemAvailable:    8000000 kB
Buffers:          123456 kB
Cached:          2345678 kB
"#;
        let (total, available) = parse_meminfo(sample);
        assert_eq!(total, 16384000 * 1024);
        assert_eq!(available, 8000000 * 1024);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_meminfo_no_available() {
        let sample = r#"MemTotal:       16384000 kB
MemFree:         1000000 kB
Buffers:          500000 kB
Cached:          2000000 kB
"#;
        let (_, available) = parse_meminfo(sample);
        assert_eq!(available, (1000000 + 500000 + 2000000) * 1024);
    }

    #[test]
    fn test_disk_usage_in_range() {
        let usage = disk_usage(Path::new("/")).unwrap();
        assert!((0.0..=1.0).contains(&usage));
    }
}

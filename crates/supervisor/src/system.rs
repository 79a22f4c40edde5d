//! Host resource snapshot reported alongside fleet status.

use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuStats {
    pub name: String,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemStats {
    pub cpu_count: usize,
    /// Disk holding the kiln root. Zeroed when it cannot be read.
    pub disk: DiskUsage,
    /// Not collected yet; always `None`.
    pub gpu: Option<GpuStats>,
}

impl SystemStats {
    /// Blocking: performs a filesystem syscall.
    pub fn collect(root: &Path) -> Self {
        Self {
            cpu_count: std::thread::available_parallelism().map_or(1, usize::from),
            disk: disk_usage(root),
            gpu: None,
        }
    }
}

/// Disk usage of the filesystem containing `path`, or of its nearest
/// existing ancestor.
pub fn disk_usage(path: &Path) -> DiskUsage {
    let existing = path.ancestors().find(|p| p.exists()).unwrap_or(path);

    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let Ok(c_path) = CString::new(existing.as_os_str().as_bytes()) else {
            return DiskUsage::default();
        };
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();

        // SAFETY: `c_path` is a valid NUL-terminated string and `stat` points
        // to writable memory of the right size.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            // SAFETY: statvfs returned success, so it initialised `stat`.
            let stat = unsafe { stat.assume_init() };
            let block_size = stat.f_frsize as u64;
            let total = stat.f_blocks as u64 * block_size;
            let free = stat.f_bavail as u64 * block_size;
            return DiskUsage {
                total_bytes: total,
                used_bytes: total.saturating_sub(free),
                free_bytes: free,
            };
        }
    }

    let _ = existing;
    DiskUsage::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_least_one_cpu() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SystemStats::collect(dir.path()).cpu_count >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn missing_root_uses_nearest_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let usage = disk_usage(&dir.path().join("not").join("yet"));
        assert!(usage.total_bytes > 0);
        assert!(usage.used_bytes <= usage.total_bytes);
    }
}

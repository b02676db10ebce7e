//! Process memory usage, recorded in abort reports.

/// Bytes of memory currently in use by this process.
///
/// Best effort: returns 0 where the platform offers no cheap answer. Reads
/// OS counters only; must not allocate significantly, since it runs on the
/// abort path.
pub fn memory_usage() -> u64 {
    imp::resident_bytes().unwrap_or(0)
}

#[cfg(target_os = "linux")]
mod imp {
    pub fn resident_bytes() -> Option<u64> {
        // /proc/self/statm: size resident shared text lib data dt, in pages
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(resident_pages * page_size as u64)
    }
}

#[cfg(target_os = "macos")]
mod imp {
    pub fn resident_bytes() -> Option<u64> {
        unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
                return None;
            }
            // ru_maxrss is in bytes on macOS
            u64::try_from(usage.ru_maxrss).ok()
        }
    }
}

#[cfg(windows)]
mod imp {
    pub fn resident_bytes() -> Option<u64> {
        use windows_sys::Win32::System::ProcessStatus::{
            GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS,
        };
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        unsafe {
            let mut counters: PROCESS_MEMORY_COUNTERS = std::mem::zeroed();
            counters.cb = std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32;
            if GetProcessMemoryInfo(
                GetCurrentProcess(),
                &mut counters,
                std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
            ) == 0
            {
                return None;
            }
            Some(counters.WorkingSetSize as u64)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod imp {
    pub fn resident_bytes() -> Option<u64> {
        None
    }
}

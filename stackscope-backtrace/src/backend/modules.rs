//! Loaded-module scan shared by the backends.
//!
//! Walks the process's shared-library list and finds the image whose mapped
//! segments contain a given address. Used when the loader's own lookup
//! (`dladdr`, DbgHelp) comes back empty.

use findshlibs::{Segment, SharedLibrary, TargetSharedLibrary, TARGET_SUPPORTED};

use super::ModuleInfo;

pub(crate) fn module_containing(address: u64) -> Option<ModuleInfo> {
    if !TARGET_SUPPORTED {
        return None;
    }

    let mut found: Option<ModuleInfo> = None;
    TargetSharedLibrary::each(|shlib| {
        if found.is_some() {
            return;
        }
        let base = shlib.actual_load_addr().0 as u64;
        for seg in shlib.segments() {
            if !seg.is_code() {
                continue;
            }
            let start = seg.actual_virtual_memory_address(shlib).0 as u64;
            let end = start + seg.len() as u64;
            if (start..end).contains(&address) {
                let mut path = shlib.name().to_string_lossy().to_string();
                if path.is_empty() {
                    path = std::env::current_exe()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                }
                found = Some(ModuleInfo {
                    path,
                    base,
                    symbol: None,
                });
                return;
            }
        }
    });

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_module_for_own_code() {
        if !TARGET_SUPPORTED {
            return;
        }
        let address = finds_module_for_own_code as usize as u64;
        let info = module_containing(address).expect("own code must be mapped");
        assert!(!info.path.is_empty());
        assert!(info.base <= address);
    }

    #[test]
    fn misses_for_null() {
        assert!(module_containing(0).is_none());
    }
}

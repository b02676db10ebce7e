//! Turns raw addresses into structured [`StackFrame`]s.
//!
//! Resolution layers three sources, cheapest first:
//!
//! 1. the dynamic loader (`module_of`): module path, load base, and a name
//!    for exported symbols;
//! 2. the executable's own symbol table (the `nm` cache), which knows the
//!    non-exported names the loader cannot see — consulted for addresses
//!    the loader left unnamed or unattributed. A loader name always wins
//!    over a cache name;
//! 3. the platform's offline symboliser for file and line, and for a name
//!    when the first two produced none.
//!
//! Every layer is allowed to fail; a frame with only its address populated
//! is still returned.

use stackscope_types::StackFrame;

use crate::backend;
use crate::symbols;
use crate::utils::demangle;

/// Resolves a single address into a frame.
pub fn resolve(address: u64) -> StackFrame {
    let mut frame = StackFrame::from_address(address);
    if address == 0 {
        return frame;
    }

    if let Some(info) = backend::module_of(address) {
        frame.address2 = address.abs_diff(info.base);
        frame.object = info.path;
        if let Some(symbol) = info.symbol {
            frame.function = demangle(&symbol);
        }
    }

    // The nm table only describes the main executable, so it must not be
    // probed for addresses the loader attributed to some other image.
    let executable = crate::executable_path();
    let in_executable = frame.object.is_empty() || frame.object == executable;
    if frame.function.is_empty() && in_executable {
        if let Ok(table) = symbols::load() {
            // The table holds link-time addresses; position-independent
            // executables need the load-relative address instead.
            let record = if frame.address2 != 0 {
                table.find(frame.address2).or_else(|| table.find(address))
            } else {
                table.find(address)
            };
            if let Some(record) = record {
                frame.function = record.name.clone();
            }
            if frame.object.is_empty() {
                frame.object = executable.clone();
            }
        }
    }

    // Shared objects are mapped at an arbitrary base; the offline
    // symboliser wants the load-relative address for those.
    let query = if is_shared_object(&frame.object) {
        frame.address2
    } else {
        frame.address
    };
    let offline = backend::symbolise_offline(&frame.object, query);
    if frame.function.is_empty() {
        if let Some(function) = offline.function {
            frame.function = function;
        }
    }
    if let Some(filename) = offline.filename {
        frame.set_location(&filename, offline.line.unwrap_or(0));
    }

    frame
}

/// Resolves a sequence of captured addresses, preserving order.
pub fn resolve_all(addresses: &[u64]) -> Vec<StackFrame> {
    addresses.iter().map(|&address| resolve(address)).collect()
}

fn is_shared_object(object: &str) -> bool {
    object.contains(".so") || object.ends_with(".dylib")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_address_resolves_to_bare_frame() {
        let frame = resolve(0);
        assert_eq!(frame, StackFrame::default());
    }

    #[test]
    fn own_function_resolves_to_module() {
        let address = own_function_resolves_to_module as usize as u64;
        let frame = resolve(address);
        assert_eq!(frame.address, address);
        // the test binary is always a known module
        assert!(!frame.object.is_empty());
        // location, when present, is consistent
        if frame.filename.is_empty() {
            assert_eq!(frame.line, 0);
        }
    }

    #[test]
    fn location_invariant_holds_across_a_capture() {
        for frame in crate::current_stack() {
            if frame.filename.is_empty() {
                assert_eq!(frame.line, 0, "frame {frame:?}");
            }
            assert_ne!(frame.address, 0);
        }
    }

    #[test]
    fn shared_object_detection() {
        assert!(is_shared_object("/usr/lib/libc.so.6"));
        assert!(is_shared_object("/usr/lib/libfoo.dylib"));
        assert!(!is_shared_object("/usr/bin/app"));
    }
}

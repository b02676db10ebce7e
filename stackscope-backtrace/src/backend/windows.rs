//! Capture primitives for Windows, built on DbgHelp.
//!
//! DbgHelp needs one-time initialisation: assemble the symbol search path,
//! call `SymInitialize`, then preload the module list so `StackWalk64` and
//! `SymFromAddr` can attribute addresses. Initialisation runs through a
//! small state machine; if both module-enumeration paths fail the backend
//! stays in `Failed` and answers like the fallback backend from then on.
//!
//! DbgHelp is single-threaded by contract, so every call into it holds one
//! process-wide lock.

use std::collections::BTreeSet;
use std::ffi::CStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::Debug::{
    RtlCaptureContext, StackWalk64, SymFromAddr, SymFunctionTableAccess64, SymGetLineFromAddr64,
    SymGetModuleBase64, SymGetModuleInfo64, SymInitialize, SymLoadModule64, SymSetOptions,
    AddrModeFlat, CONTEXT, IMAGEHLP_LINE64, IMAGEHLP_MODULE64, STACKFRAME64, SYMBOL_INFO,
    SYMOPT_FAIL_CRITICAL_ERRORS, SYMOPT_LOAD_LINES, SYMOPT_UNDNAME,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32First, Module32Next, MODULEENTRY32, TH32CS_SNAPMODULE,
};
use windows_sys::Win32::System::ProcessStatus::{
    EnumProcessModules, GetModuleFileNameExA, GetModuleInformation, MODULEINFO,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, GetCurrentThread, GetCurrentThreadId,
};

use crate::error::CaptureError;
use crate::{RawBacktrace, StopReason};

use super::{ModuleInfo, OfflineSymbol, ThreadHandle};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALISING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_FAILED: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static DBGHELP: Mutex<()> = Mutex::new(());

const MAX_RECURSION: u32 = 1024;

/// Drives the state machine to `Ready` or `Failed`, returning whether
/// DbgHelp is usable. The first caller initialises; racers spin until the
/// outcome is decided.
fn ensure_ready() -> bool {
    loop {
        match STATE.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALISING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let ok = initialise();
                STATE.store(
                    if ok { STATE_READY } else { STATE_FAILED },
                    Ordering::Release,
                );
                return ok;
            }
            Err(STATE_INITIALISING) => std::thread::yield_now(),
            Err(state) => return state == STATE_READY,
        }
    }
}

fn initialise() -> bool {
    let _guard = DBGHELP.lock().unwrap_or_else(|poison| poison.into_inner());
    let process = unsafe { GetCurrentProcess() };

    let mut search_path: Vec<u8> = symbol_search_path().into_bytes();
    search_path.push(0);

    unsafe {
        SymSetOptions(SYMOPT_LOAD_LINES | SYMOPT_UNDNAME | SYMOPT_FAIL_CRITICAL_ERRORS);
        if SymInitialize(process, search_path.as_ptr(), 0) == 0 {
            return false;
        }
    }

    // Preload the module list: first the ToolHelp snapshot, then PSAPI.
    load_modules_toolhelp(process) || load_modules_psapi(process)
}

fn load_modules_toolhelp(process: HANDLE) -> bool {
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, GetCurrentProcessId());
        if snapshot == INVALID_HANDLE_VALUE {
            return false;
        }
        let mut entry: MODULEENTRY32 = std::mem::zeroed();
        entry.dwSize = std::mem::size_of::<MODULEENTRY32>() as u32;
        let mut count = 0u32;
        let mut more = Module32First(snapshot, &mut entry) != 0;
        while more {
            SymLoadModule64(
                process,
                0,
                entry.szExePath.as_ptr(),
                entry.szModule.as_ptr(),
                entry.modBaseAddr as u64,
                entry.modBaseSize,
            );
            count += 1;
            more = Module32Next(snapshot, &mut entry) != 0;
        }
        CloseHandle(snapshot);
        count > 0
    }
}

fn load_modules_psapi(process: HANDLE) -> bool {
    unsafe {
        let mut handles = [0isize; 1024];
        let mut needed = 0u32;
        let size = std::mem::size_of_val(&handles) as u32;
        if EnumProcessModules(process, handles.as_mut_ptr() as *mut _, size, &mut needed) == 0 {
            return false;
        }
        let count = (needed as usize / std::mem::size_of::<isize>()).min(handles.len());
        let mut loaded = 0u32;
        for &module in &handles[..count] {
            let mut info: MODULEINFO = std::mem::zeroed();
            if GetModuleInformation(
                process,
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            ) == 0
            {
                continue;
            }
            let mut path = [0u8; 1024];
            GetModuleFileNameExA(process, module, path.as_mut_ptr(), path.len() as u32);
            SymLoadModule64(
                process,
                0,
                path.as_ptr(),
                std::ptr::null(),
                info.lpBaseOfDll as u64,
                info.SizeOfImage,
            );
            loaded += 1;
        }
        loaded > 0
    }
}

/// Builds the DbgHelp symbol search path.
///
/// Current directory, executable directory, the `_NT_SYMBOL_PATH` /
/// `_NT_ALTERNATE_SYMBOL_PATH` overrides, the system directories, and the
/// Microsoft symbol server.
pub(crate) fn symbol_search_path() -> String {
    let mut paths = String::from(".;");
    if let Ok(cwd) = std::env::current_dir() {
        paths.push_str(&cwd.display().to_string());
        paths.push(';');
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push_str(&dir.display().to_string());
            paths.push(';');
        }
    }
    for var in ["_NT_SYMBOL_PATH", "_NT_ALTERNATE_SYMBOL_PATH"] {
        if let Ok(value) = std::env::var(var) {
            paths.push_str(&value);
            paths.push(';');
        }
    }
    if let Ok(root) = std::env::var("SYSTEMROOT") {
        paths.push_str(&root);
        paths.push(';');
        paths.push_str(&root);
        paths.push_str("\\system32;");
    }
    match std::env::var("SYSTEMDRIVE") {
        Ok(drive) => {
            paths.push_str("SRV*;");
            paths.push_str(&drive);
            paths.push_str("\\websymbols*http://msdl.microsoft.com/download/symbols;");
        }
        Err(_) => {
            paths.push_str("SRV*c:\\websymbols*http://msdl.microsoft.com/download/symbols;");
        }
    }
    paths
}

pub(crate) fn executable_path() -> String {
    std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

pub(crate) fn this_thread() -> ThreadHandle {
    ThreadHandle(unsafe { GetCurrentThreadId() } as u64)
}

pub(crate) fn enumerate_threads() -> BTreeSet<ThreadHandle> {
    let mut threads = BTreeSet::new();
    threads.insert(this_thread());
    threads
}

pub(crate) fn capture_thread(
    _thread: ThreadHandle,
    _max_depth: usize,
) -> Result<RawBacktrace, CaptureError> {
    Err(CaptureError::Unsupported(
        "cross-thread stack capture on Windows",
    ))
}

pub(crate) fn capture(max_depth: usize) -> RawBacktrace {
    if !ensure_ready() {
        // DbgHelp failed once; fall back to the frame-pointer walker.
        let mut addresses = Vec::new();
        let mut stop = StopReason::Complete;
        backtrace::trace(|frame| {
            if addresses.len() >= max_depth {
                stop = StopReason::DepthLimit;
                return false;
            }
            addresses.push(frame.ip() as u64);
            true
        });
        return RawBacktrace { addresses, stop };
    }

    let _guard = DBGHELP.lock().unwrap_or_else(|poison| poison.into_inner());
    let process = unsafe { GetCurrentProcess() };
    let thread = unsafe { GetCurrentThread() };

    let mut context: CONTEXT = unsafe { std::mem::zeroed() };
    unsafe { RtlCaptureContext(&mut context) };

    let mut frame: STACKFRAME64 = unsafe { std::mem::zeroed() };
    #[cfg(target_arch = "x86_64")]
    let image_type = {
        frame.AddrPC.Offset = context.Rip;
        frame.AddrPC.Mode = AddrModeFlat;
        frame.AddrFrame.Offset = context.Rsp;
        frame.AddrFrame.Mode = AddrModeFlat;
        frame.AddrStack.Offset = context.Rsp;
        frame.AddrStack.Mode = AddrModeFlat;
        0x8664u32 // IMAGE_FILE_MACHINE_AMD64
    };
    #[cfg(target_arch = "x86")]
    let image_type = {
        frame.AddrPC.Offset = context.Eip as u64;
        frame.AddrPC.Mode = AddrModeFlat;
        frame.AddrFrame.Offset = context.Ebp as u64;
        frame.AddrFrame.Mode = AddrModeFlat;
        frame.AddrStack.Offset = context.Esp as u64;
        frame.AddrStack.Mode = AddrModeFlat;
        0x014cu32 // IMAGE_FILE_MACHINE_I386
    };

    let mut addresses = Vec::new();
    let mut stop = StopReason::Complete;
    let mut recursion = 0u32;
    loop {
        let ok = unsafe {
            StackWalk64(
                image_type,
                process,
                thread,
                &mut frame,
                &mut context as *mut CONTEXT as *mut _,
                None,
                Some(SymFunctionTableAccess64),
                Some(SymGetModuleBase64),
                None,
            )
        };
        if ok == 0 {
            break;
        }
        // The OS walker occasionally reports a frame that returns into
        // itself forever; cut the walk once that stops looking plausible.
        if frame.AddrPC.Offset == frame.AddrReturn.Offset {
            recursion += 1;
            if recursion > MAX_RECURSION {
                stop = StopReason::Recursion;
                break;
            }
        } else {
            recursion = 0;
        }
        if frame.AddrPC.Offset != 0 {
            addresses.push(frame.AddrPC.Offset);
        }
        if addresses.len() >= max_depth {
            stop = StopReason::DepthLimit;
            break;
        }
        if frame.AddrReturn.Offset == 0 {
            break;
        }
    }
    RawBacktrace { addresses, stop }
}

pub(crate) fn module_of(address: u64) -> Option<ModuleInfo> {
    if !ensure_ready() {
        return None;
    }
    let _guard = DBGHELP.lock().unwrap_or_else(|poison| poison.into_inner());
    let process = unsafe { GetCurrentProcess() };

    let mut module: IMAGEHLP_MODULE64 = unsafe { std::mem::zeroed() };
    module.SizeOfStruct = std::mem::size_of::<IMAGEHLP_MODULE64>() as u32;
    if unsafe { SymGetModuleInfo64(process, address, &mut module) } == 0 {
        return None;
    }
    let path = cstr_from_bytes(&module.LoadedImageName);
    if path.is_empty() {
        return None;
    }

    let symbol = lookup_symbol_name(process, address);
    Some(ModuleInfo {
        path,
        base: module.BaseOfImage,
        symbol,
    })
}

fn lookup_symbol_name(process: HANDLE, address: u64) -> Option<String> {
    const MAX_NAME: usize = 1024;
    // SYMBOL_INFO is a header followed by an inline name buffer.
    let mut buffer = vec![0u8; std::mem::size_of::<SYMBOL_INFO>() + MAX_NAME];
    let info = buffer.as_mut_ptr() as *mut SYMBOL_INFO;
    unsafe {
        (*info).SizeOfStruct = std::mem::size_of::<SYMBOL_INFO>() as u32;
        (*info).MaxNameLen = MAX_NAME as u32;
        let mut displacement = 0u64;
        if SymFromAddr(process, address, &mut displacement, info) == 0 {
            return None;
        }
        let name = CStr::from_ptr((*info).Name.as_ptr() as *const i8)
            .to_string_lossy()
            .into_owned();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

/// DbgHelp serves the line-table queries in-process; no external tool runs
/// on Windows.
pub(crate) fn symbolise_offline(_object: &str, address: u64) -> OfflineSymbol {
    if address == 0 || !ensure_ready() {
        return OfflineSymbol::default();
    }
    let _guard = DBGHELP.lock().unwrap_or_else(|poison| poison.into_inner());
    let process = unsafe { GetCurrentProcess() };

    let mut result = OfflineSymbol {
        function: lookup_symbol_name(process, address),
        ..Default::default()
    };

    let mut line: IMAGEHLP_LINE64 = unsafe { std::mem::zeroed() };
    line.SizeOfStruct = std::mem::size_of::<IMAGEHLP_LINE64>() as u32;
    let mut displacement = 0u32;
    if unsafe { SymGetLineFromAddr64(process, address, &mut displacement, &mut line) } != 0 {
        let filename = unsafe { CStr::from_ptr(line.FileName as *const i8) }
            .to_string_lossy()
            .into_owned();
        if !filename.is_empty() {
            result.filename = Some(filename);
            result.line = Some(line.LineNumber);
        }
    }
    result
}

fn cstr_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

//! Cached symbol table of the running executable.
//!
//! The dynamic loader only resolves names for exported symbols; everything
//! else in the main executable needs its symbol table. The table is built
//! once, by running the platform's name-listing tool (`nm`) over the
//! executable, and cached process-wide. The first failure is cached too, so
//! a missing tool costs one spawn attempt rather than one per lookup.

use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;

use crate::error::SymbolsError;

/// One entry of the executable's symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    /// Start address of the symbol.
    pub address: u64,
    /// Single-character linkage kind as reported by the lister (`T`, `t`,
    /// `B`, `D`, `W`, …), interpreted opaquely.
    pub kind: char,
    /// Symbol name, demangled by the lister where possible.
    pub name: String,
}

/// The executable's symbol table, sorted ascending by address.
///
/// Frozen after construction; duplicate addresses are permitted and keep
/// their parse order.
#[derive(Debug, Default)]
pub struct SymbolTable {
    records: Vec<SymbolRecord>,
}

impl SymbolTable {
    /// Parses name-lister output.
    ///
    /// Accepted lines have the form `<hex-address> <kind> <name…>`. Lines
    /// starting with whitespace (undefined symbols) and lines with fewer
    /// than three fields are skipped without error.
    pub fn parse(listing: &str) -> Self {
        let mut records = Vec::new();
        for line in listing.lines() {
            if line.starts_with([' ', '\t']) {
                continue;
            }
            let mut fields = line.splitn(3, ' ');
            let (Some(address), Some(kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(address) = u64::from_str_radix(address, 16) else {
                continue;
            };
            let Some(kind) = kind.chars().next() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            records.push(SymbolRecord {
                address,
                kind,
                name: name.trim_end().to_owned(),
            });
        }
        // nm -n already sorts by address; keep equal addresses in stream
        // order so lookups stay first-wins.
        records.sort_by_key(|r| r.address);
        SymbolTable { records }
    }

    /// All records, ascending by address.
    pub fn records(&self) -> &[SymbolRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finds the record whose body contains `address`: the nearest record
    /// strictly preceding it.
    ///
    /// Misses when `address` precedes the first record or the table is
    /// empty. Among duplicate addresses the earliest-parsed record wins.
    pub fn find(&self, address: u64) -> Option<&SymbolRecord> {
        let idx = self.records.partition_point(|r| r.address < address);
        if idx == 0 {
            return None;
        }
        let candidate = &self.records[idx - 1];
        let first = self.records[..idx - 1]
            .iter()
            .rposition(|r| r.address != candidate.address)
            .map(|p| p + 1)
            .unwrap_or(0);
        Some(&self.records[first])
    }
}

enum CacheState {
    Unloaded,
    Loaded(Arc<SymbolTable>),
    Failed(SymbolsError),
}

static CACHE: Lazy<RwLock<CacheState>> = Lazy::new(|| RwLock::new(CacheState::Unloaded));
// Serializes the expensive first load without blocking readers of an
// already-populated cache.
static LOAD: Mutex<()> = Mutex::new(());

/// Returns the executable's symbol table, loading it on first use.
///
/// Idempotent: the first successful call populates the table and every
/// later call returns the same `Arc`. A failed load is cached the same way
/// until [`clear`] resets the state.
pub fn load() -> Result<Arc<SymbolTable>, SymbolsError> {
    if let Some(result) = cached() {
        return result;
    }

    let _guard = LOAD.lock().unwrap_or_else(|poison| poison.into_inner());
    // A racer may have finished the load while we waited.
    if let Some(result) = cached() {
        return result;
    }

    let outcome = list_symbols().map(|listing| Arc::new(SymbolTable::parse(&listing)));
    let mut state = CACHE.write().unwrap_or_else(|poison| poison.into_inner());
    match outcome {
        Ok(table) => {
            *state = CacheState::Loaded(Arc::clone(&table));
            Ok(table)
        }
        Err(err) => {
            *state = CacheState::Failed(err.clone());
            Err(err)
        }
    }
}

fn cached() -> Option<Result<Arc<SymbolTable>, SymbolsError>> {
    let state = CACHE.read().unwrap_or_else(|poison| poison.into_inner());
    match &*state {
        CacheState::Unloaded => None,
        CacheState::Loaded(table) => Some(Ok(Arc::clone(table))),
        CacheState::Failed(err) => Some(Err(err.clone())),
    }
}

/// Looks up the symbol containing `address` in the cached table, loading
/// the table if needed.
pub fn lookup(address: u64) -> Option<SymbolRecord> {
    load().ok()?.find(address).cloned()
}

/// Drops the cached table (or cached failure).
///
/// In-flight readers keep whatever table they already hold; the next
/// [`load`] rebuilds from scratch.
pub fn clear() {
    let mut state = CACHE.write().unwrap_or_else(|poison| poison.into_inner());
    *state = CacheState::Unloaded;
}

#[cfg(target_os = "linux")]
fn list_symbols() -> Result<String, SymbolsError> {
    use std::process::Command;

    let exe = crate::executable_path();
    if exe.is_empty() {
        return Err(SymbolsError::Spawn("executable path unknown".into()));
    }
    let output = crate::exec::run(
        Command::new("nm").arg("-n").arg("--demangle").arg(&exe),
        crate::exec::LIST_DEADLINE,
    )
    .map_err(|err| SymbolsError::Spawn(err.to_string()))?;
    if output.status != 0 {
        return Err(SymbolsError::ToolFailed(output.status));
    }
    Ok(output.stdout)
}

#[cfg(target_os = "macos")]
fn list_symbols() -> Result<String, SymbolsError> {
    use std::process::Command;

    let exe = crate::executable_path();
    if exe.is_empty() {
        return Err(SymbolsError::Spawn("executable path unknown".into()));
    }
    let output = crate::exec::run_piped(
        Command::new("nm").arg("-n").arg(&exe),
        &mut Command::new("c++filt"),
        crate::exec::LIST_DEADLINE,
    )
    .map_err(|err| SymbolsError::Spawn(err.to_string()))?;
    if output.status != 0 {
        return Err(SymbolsError::ToolFailed(output.status));
    }
    Ok(output.stdout)
}

// DbgHelp serves symbol queries directly on Windows; the nm cache stays
// empty there, as on any other target without a lister.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn list_symbols() -> Result<String, SymbolsError> {
    Err(SymbolsError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
0000000000001000 T alpha
0000000000002000 t beta
0000000000002000 t beta_alias
0000000000003000 W gamma
                 U undefined_symbol
0000000000004000 D
not-an-address T junk
0000000000005000 B delta
";

    #[test]
    fn parser_skips_bad_lines() {
        let table = SymbolTable::parse(LISTING);
        let names: Vec<&str> = table.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta", "beta_alias", "gamma", "delta"]);
        assert_eq!(table.records()[0].kind, 'T');
    }

    #[test]
    fn parser_keeps_name_with_spaces() {
        let table = SymbolTable::parse("0000000000001000 T operator new(unsigned long)\n");
        assert_eq!(table.records()[0].name, "operator new(unsigned long)");
    }

    #[test]
    fn find_returns_containing_symbol() {
        let table = SymbolTable::parse(LISTING);
        // inside alpha's body
        assert_eq!(table.find(0x1800).unwrap().name, "alpha");
        // inside gamma's body
        assert_eq!(table.find(0x3abc).unwrap().name, "gamma");
        // past the last symbol: delta contains it
        assert_eq!(table.find(0xffff_ffff).unwrap().name, "delta");
    }

    #[test]
    fn find_misses_before_first_record() {
        let table = SymbolTable::parse(LISTING);
        assert!(table.find(0x0fff).is_none());
        assert!(table.find(0).is_none());
        assert!(SymbolTable::default().find(0x1000).is_none());
    }

    #[test]
    fn find_is_first_wins_on_duplicates() {
        let table = SymbolTable::parse(LISTING);
        // beta and beta_alias share an address; the earliest parsed wins
        assert_eq!(table.find(0x2800).unwrap().name, "beta");
    }

    #[test]
    fn find_is_monotone() {
        let table = SymbolTable::parse(LISTING);
        let mut last = 0u64;
        for probe in [0x1001, 0x2001, 0x2fff, 0x3001, 0x5001, 0x6001] {
            let record = table.find(probe).unwrap();
            assert!(record.address >= last);
            last = record.address;
        }
    }

    #[test]
    fn clear_resets_cache_state() {
        clear();
        // after clear the next load starts from scratch; both outcomes are
        // legal depending on the host, but they must be stable across calls
        let first = load().map(|t| t.len());
        let second = load().map(|t| t.len());
        assert_eq!(first.is_ok(), second.is_ok());
        clear();
    }
}

//! Symbol-name cleanup.
//!
//! Names arrive in three shapes: raw mangled (`_ZN…`, `_R…`) from the
//! loader, half-demangled legacy Rust with `$LT$`-style escapes and a
//! trailing disambiguator hash, and already-clean output from `nm
//! --demangle`. [`demangle`] normalises all of them.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static TRAILING_HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?x) ^(.*)::h[a-f0-9]{16}$").unwrap());

static CRATE_DISAMBIGUATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?x) \[[a-f0-9]{16}\]").unwrap());

static SYMBOL_ESCAPES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \$
            (SP|BP|RF|LT|GT|LP|RP|C|
                u7e|u20|u27|u5b|u5d|u7b|u7d|u3b|u2b|u22)
        \$
    ",
    )
    .unwrap()
});

/// Produces a human-readable name from whatever the toolchain handed back.
pub(crate) fn demangle(symbol: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(symbol) {
        return strip_hash(&demangled.to_string()).into_owned();
    }
    let stripped = strip_hash(symbol);
    replace_escapes(&stripped).into_owned()
}

/// Removes the `::h0123…` suffix and `[0123…]` crate disambiguators.
fn strip_hash(symbol: &str) -> Cow<'_, str> {
    let symbol = match TRAILING_HASH_RE.captures(symbol) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(symbol),
        None => symbol,
    };
    CRATE_DISAMBIGUATOR_RE.replace_all(symbol, "")
}

/// Replaces the `$LT$`-style escapes of legacy Rust mangling.
fn replace_escapes<'a>(symbol: &'a str) -> Cow<'a, str> {
    SYMBOL_ESCAPES_RE.replace_all(symbol, |caps: &Captures<'_>| match &caps[1] {
        "SP" => "@",
        "BP" => "*",
        "RF" => "&",
        "LT" => "<",
        "GT" => ">",
        "LP" => "(",
        "RP" => ")",
        "C" => ",",
        "u7e" => "~",
        "u20" => " ",
        "u27" => "'",
        "u5b" => "[",
        "u5d" => "]",
        "u7b" => "{",
        "u7d" => "}",
        "u3b" => ";",
        "u2b" => "+",
        "u22" => "\"",
        _ => unreachable!(),
    })
}

/// Splits a resolved function name into its module-path segments.
///
/// Tolerates the spellings symbols pick up along the toolchain: the legacy
/// `..` separator, and the `_<…>` / `<…>` wrapper around trait
/// implementations (the wrapper is dropped so the implementing type's own
/// path leads).
fn path_segments(name: &str) -> impl Iterator<Item = &str> {
    let inner = name.strip_prefix("_<").or_else(|| name.strip_prefix('<'));
    inner
        .unwrap_or(name)
        .split("::")
        .flat_map(|part| part.split(".."))
        .filter(|segment| !segment.is_empty())
}

/// Whether a resolved function name lives under the given module path.
///
/// `pattern` is a `::`-separated path; every pattern segment must equal the
/// corresponding leading segment of the name. A lone segment therefore
/// matches that exact name (plus anything nested below it), never a mere
/// name prefix: `"raise"` matches `raise` but not `raise_signal`.
pub(crate) fn in_module(name: &str, pattern: &str) -> bool {
    let mut segments = path_segments(name);
    pattern
        .split("::")
        .filter(|want| !want.is_empty())
        .all(|want| segments.next() == Some(want))
}

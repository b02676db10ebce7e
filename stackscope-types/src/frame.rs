use std::fmt;

use serde::{Deserialize, Serialize};

/// A single resolved stack frame.
///
/// Fields that could not be resolved are left at their empty/zero values
/// rather than wrapped in `Option`: an empty `object` means "module unknown",
/// a `line` of 0 means "line unknown". A frame with only `address` populated
/// is still a valid frame.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    /// Virtual program counter of the frame.
    pub address: u64,
    /// Offset of `address` from the base of the owning shared object.
    ///
    /// 0 for addresses inside the main executable.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub address2: u64,
    /// Path of the module containing `address`; empty if unknown.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object: String,
    /// Demangled function name; empty if unresolved.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    /// Source file name; empty if unavailable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    /// 1-based source line, 0 meaning unknown.
    ///
    /// Only meaningful when `filename` is set.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub line: u32,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl StackFrame {
    /// Creates a frame carrying only a raw address.
    pub fn from_address(address: u64) -> Self {
        StackFrame {
            address,
            ..Default::default()
        }
    }

    /// Resets the frame to its unresolved state.
    pub fn clear(&mut self) {
        *self = StackFrame::default();
    }

    /// Whether two frames refer to the same call site.
    ///
    /// Address equality is sufficient for frames produced by a capture
    /// backend. Frames synthesised without an address (address 0) compare by
    /// function name instead. File and line discrepancies between threads are
    /// deliberately ignored.
    pub fn same_call(&self, other: &StackFrame) -> bool {
        if self.address != 0 || other.address != 0 {
            self.address == other.address
        } else {
            self.function == other.function
        }
    }

    /// Sets `filename` and `line` together, keeping them consistent.
    ///
    /// An empty filename forces the line to 0.
    pub fn set_location(&mut self, filename: &str, line: u32) {
        self.filename = filename.to_owned();
        self.line = if self.filename.is_empty() { 0 } else { line };
    }
}

/// Strips the directory portion of a path, handling both separator styles.
pub(crate) fn strip_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}:  ", self.address)?;
        write!(f, "{:<24}", strip_path(&self.object))?;
        write!(f, "  {}", self.function)?;
        if !self.filename.is_empty() {
            write!(f, "  {}", strip_path(&self.filename))?;
            if self.line > 0 {
                write!(f, ":{}", self.line)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_invariant() {
        let mut frame = StackFrame::from_address(0x1000);
        frame.set_location("", 42);
        assert!(frame.filename.is_empty());
        assert_eq!(frame.line, 0);

        frame.set_location("lib.rs", 42);
        assert_eq!(frame.filename, "lib.rs");
        assert_eq!(frame.line, 42);
    }

    #[test]
    fn same_call_by_address() {
        let a = StackFrame {
            address: 0x1000,
            function: "alpha".into(),
            ..Default::default()
        };
        let b = StackFrame {
            address: 0x1000,
            function: "beta".into(),
            filename: "other.rs".into(),
            line: 7,
            ..Default::default()
        };
        assert!(a.same_call(&b));

        let c = StackFrame::from_address(0x2000);
        assert!(!a.same_call(&c));
    }

    #[test]
    fn same_call_synthesised_frames() {
        let a = StackFrame {
            function: "<signal handler>".into(),
            ..Default::default()
        };
        let b = StackFrame {
            function: "<signal handler>".into(),
            ..Default::default()
        };
        assert!(a.same_call(&b));

        let c = StackFrame {
            function: "main".into(),
            ..Default::default()
        };
        assert!(!a.same_call(&c));
    }

    #[test]
    fn display_strips_paths() {
        let frame = StackFrame {
            address: 0xdeadbeef,
            object: "/usr/lib/libfoo.so".into(),
            function: "foo::bar".into(),
            filename: "/src/foo/bar.rs".into(),
            line: 12,
            ..Default::default()
        };
        let text = frame.to_string();
        assert!(text.contains("libfoo.so"));
        assert!(text.contains("foo::bar"));
        assert!(text.contains("bar.rs:12"));
        assert!(!text.contains("/usr/lib"));
    }

    #[test]
    fn serde_skips_empty_fields() {
        let frame = StackFrame::from_address(0x1234);
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"address":4660}"#);

        let back: StackFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::multi::MultiStack;

/// What drove the process into the terminate path.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AbortCause {
    /// An asynchronous signal was translated into an abort.
    Signal,
    /// An error value escaped to the top-level guard.
    Exception,
    /// An explicit abort call.
    Abort,
    /// A termination requested through the global-abort bridge.
    Global,
    /// Anything else.
    #[default]
    Unknown,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbortCause::Signal => "signal",
            AbortCause::Exception => "exception",
            AbortCause::Abort => "abort",
            AbortCause::Global => "global",
            AbortCause::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Call-site information attached to an [`AbortError`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file of the call site.
    pub file: String,
    /// 1-based line of the call site, 0 if unknown.
    pub line: u32,
    /// Enclosing function, if recorded.
    pub function: String,
}

impl SourceLocation {
    /// Creates a location from explicit parts.
    pub fn new(file: &str, line: u32, function: &str) -> Self {
        SourceLocation {
            file: file.to_owned(),
            line,
            function: function.to_owned(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            return f.write_str("<unknown>");
        }
        write!(f, "{}:{}", self.file, self.line)?;
        if !self.function.is_empty() {
            write!(f, " ({})", self.function)?;
        }
        Ok(())
    }
}

/// Captures the current source location.
///
/// Expands to a [`SourceLocation`] carrying `file!()` and `line!()` of the
/// call site.
#[macro_export]
macro_rules! source_location {
    () => {
        $crate::SourceLocation::new(file!(), line!(), "")
    };
    ($function:expr) => {
        $crate::SourceLocation::new(file!(), line!(), $function)
    };
}

/// The record produced by the terminate path.
///
/// Built on the aborting thread; ownership transfers to whatever handler
/// consumes it. The `Display` implementation renders the full report that is
/// written to the error stream before the process goes down.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AbortError {
    /// The abort message.
    pub message: String,
    /// Where the abort was raised.
    pub source: SourceLocation,
    /// What caused the termination.
    pub cause: AbortCause,
    /// Signal number when `cause` is [`AbortCause::Signal`], 0 otherwise.
    pub signal: i32,
    /// Bytes of memory in use when the record was built.
    pub bytes_in_use: u64,
    /// Call stacks captured at the point of failure.
    pub stack: MultiStack,
    /// Whether the rendered report includes `bytes_in_use`.
    #[serde(skip)]
    pub print_memory: bool,
    /// Whether the rendered report includes the stack.
    #[serde(skip)]
    pub print_stack: bool,
}

impl AbortError {
    /// Creates a record with the given message and cause.
    ///
    /// Stack, memory and source location start empty; the abort path fills
    /// them in.
    pub fn new(message: impl Into<String>, cause: AbortCause) -> Self {
        AbortError {
            message: message.into(),
            cause,
            print_memory: true,
            print_stack: true,
            ..Default::default()
        }
    }

    fn fmt_stack(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_node(
            node: &crate::multi::StackNode,
            depth: usize,
            total: u32,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            if node.count == total {
                writeln!(f, "{:indent$}{}", "", node.frame, indent = depth)?;
            } else {
                writeln!(
                    f,
                    "{:indent$}[{}] {}",
                    "",
                    node.count,
                    node.frame,
                    indent = depth
                )?;
            }
            for child in &node.children {
                fmt_node(child, depth + 1, total, f)?;
            }
            Ok(())
        }

        for node in &self.stack.children {
            fmt_node(node, 0, self.stack.count, f)?;
        }
        Ok(())
    }
}

impl std::error::Error for AbortError {}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            AbortCause::Signal => writeln!(
                f,
                "Unhandled signal {} caught at {}:",
                self.signal, self.source
            )?,
            AbortCause::Exception => writeln!(f, "Unhandled error caught at {}:", self.source)?,
            AbortCause::Abort => writeln!(f, "Program abort called at {}:", self.source)?,
            AbortCause::Global => writeln!(f, "Global abort requested at {}:", self.source)?,
            AbortCause::Unknown => writeln!(f, "Unknown termination at {}:", self.source)?,
        }
        if !self.message.is_empty() {
            writeln!(f, "Message: {}", self.message)?;
        }
        if self.print_memory && self.bytes_in_use > 0 {
            writeln!(f, "Bytes used: {}", self.bytes_in_use)?;
        }
        if self.print_stack && !self.stack.is_empty() {
            writeln!(f, "Stack Trace:")?;
            self.fmt_stack(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StackFrame;

    #[test]
    fn source_location_macro_records_this_file() {
        let loc = source_location!();
        assert!(loc.file.ends_with("abort.rs"));
        assert!(loc.line > 0);

        let loc = source_location!("tests::demo");
        assert_eq!(loc.function, "tests::demo");
    }

    #[test]
    fn report_includes_cause_and_message() {
        let mut err = AbortError::new("boom", AbortCause::Abort);
        err.source = SourceLocation::new("main.rs", 10, "main");
        let report = err.to_string();
        assert!(report.contains("Program abort called at main.rs:10 (main)"));
        assert!(report.contains("Message: boom"));
        assert!(!report.contains("Stack Trace"));
    }

    #[test]
    fn report_respects_print_flags() {
        let mut err = AbortError::new("x", AbortCause::Signal);
        err.signal = 11;
        err.bytes_in_use = 4096;
        err.stack.add(&[StackFrame::from_address(0x10)]);

        let full = err.to_string();
        assert!(full.contains("Unhandled signal 11"));
        assert!(full.contains("Bytes used: 4096"));
        assert!(full.contains("Stack Trace:"));

        err.print_memory = false;
        err.print_stack = false;
        let bare = err.to_string();
        assert!(!bare.contains("Bytes used"));
        assert!(!bare.contains("Stack Trace"));
    }

    #[test]
    fn cause_serializes_lowercase() {
        let json = serde_json::to_string(&AbortCause::Signal).unwrap();
        assert_eq!(json, r#""signal""#);
    }
}

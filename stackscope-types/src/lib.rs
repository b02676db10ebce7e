//! Common data model shared by the `stackscope` crates.
//!
//! This crate defines the types that flow between the capture backends, the
//! address resolver and the abort path: [`StackFrame`] for a single resolved
//! call-stack entry, [`MultiStack`] for a prefix-shared tree of stacks from
//! multiple threads, and [`AbortError`] for the record built when the process
//! is going down.
//!
//! All types serialize with `serde`; [`StackFrame`] additionally has a compact
//! little-endian byte representation (see [`wire`]) for shipping stacks
//! between processes.

#![warn(missing_docs)]

mod abort;
mod frame;
mod multi;
pub mod wire;

pub use crate::abort::{AbortCause, AbortError, SourceLocation};
pub use crate::frame::StackFrame;
pub use crate::multi::{MultiStack, StackNode};
pub use crate::wire::WireError;

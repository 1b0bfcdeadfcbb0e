//! Machine-code generation: rendering captured graphs into executable memory.
//!
//! # Key Types
//! - [`CodeStorage`] - One executable mapping shared by every generated function
//!
//! The encoder itself is internal; [`crate::Rewriter`] drives it and hands out the
//! resulting function pointers.

mod encoder;
mod storage;

pub use storage::CodeStorage;

pub(crate) use encoder::encode_graph;

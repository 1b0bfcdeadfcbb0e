//! # respin Prelude
//!
//! A convenient prelude with the types nearly every user of the crate touches: the
//! rewriter itself, its configuration vocabulary, and the error types.

/// The main error type for all rewriting operations.
pub use crate::Error;

/// The result type used throughout the crate.
pub use crate::Result;

/// The rewriting session and the handle to its generated code.
pub use crate::{Rewriter, RewrittenFn};

/// Capture configuration and memory-range declarations.
pub use crate::capture::{CaptureConfig, MemRange, RangeKind};

/// The abstract value lattice driving specialization decisions.
pub use crate::capture::CaptureValue;

/// Backend handoff contract for external code generators.
pub use crate::backend::{BackendRequest, DecodeSource};

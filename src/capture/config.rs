//! Per-rewrite capture configuration.
//!
//! Configuration is what makes specialization useful: it tells the emulator which
//! parameters to treat as known constants, which memory may be read at capture time, and
//! how aggressively to fold through calls and unknown branches. All of it resets between
//! rewrite sessions.

use crate::asm::{Reg, ARG_REGS};
use crate::{Error, Result};

/// How the engine may treat memory inside a declared range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// Code that may be decoded and inlined when called with a static target.
    Function,
    /// Data that will not change between capture and execution; static-address loads
    /// from it fold to constants.
    ConstData,
    /// Data that may change; accesses are always kept in the generated code.
    MutableData,
}

/// A named address range with known properties.
#[derive(Debug, Clone)]
pub struct MemRange {
    /// Diagnostic name.
    pub name: String,
    /// First address of the range.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
    /// What the engine may assume about it.
    pub kind: RangeKind,
}

impl MemRange {
    /// True if the range covers an access of `len` bytes at `addr`.
    #[must_use]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.wrapping_add(len) <= self.start.wrapping_add(self.len)
    }
}

/// Everything the caller can tell the engine about one rewrite.
///
/// Built through `with_*` methods or mutated directly by the rewriter's setters; consumed
/// read-only during capture.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Number of integer parameters the target function takes (at most six, all passed in
    /// registers).
    pub param_count: usize,
    /// Which parameters are known constants for this rewrite.
    static_params: Vec<bool>,
    /// True if the function returns a large struct through a hidden pointer in `rdi`,
    /// shifting every visible parameter one register down.
    pub returns_via_pointer: bool,
    /// Treat calls at or beyond this depth as opaque and stop folding their results.
    pub force_unknown_depth: Option<u32>,
    /// Resolve dynamic branch conditions from the capture run's concrete values instead
    /// of failing. The generated code is then only valid for inputs that take the same
    /// paths.
    pub assume_known_branches: bool,
    ranges: Vec<MemRange>,
    /// Log every decoded instruction.
    pub trace_decode: bool,
    /// Log every captured instruction and folding decision.
    pub trace_capture: bool,
}

impl CaptureConfig {
    /// A configuration that specializes nothing: all parameters dynamic, no known memory.
    #[must_use]
    pub fn new() -> CaptureConfig {
        CaptureConfig::default()
    }

    /// Sets the parameter count.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for more than six parameters; stack-passed arguments are
    /// not modelled.
    pub fn set_param_count(&mut self, count: usize) -> Result<()> {
        if count > ARG_REGS.len() {
            return Err(Error::Config(format!(
                "{count} parameters requested, but only {} register-passed parameters are supported",
                ARG_REGS.len()
            )));
        }
        self.param_count = count;
        if self.static_params.len() < count {
            self.static_params.resize(count, false);
        }
        Ok(())
    }

    /// Declares parameter `index` (zero-based) as a known constant.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the index is out of range.
    pub fn declare_static_param(&mut self, index: usize) -> Result<()> {
        if index >= ARG_REGS.len() {
            return Err(Error::Config(format!(
                "static parameter index {index} out of range"
            )));
        }
        if self.static_params.len() <= index {
            self.static_params.resize(index + 1, false);
        }
        self.static_params[index] = true;
        if self.param_count <= index {
            self.param_count = index + 1;
        }
        Ok(())
    }

    /// True if parameter `index` was declared static.
    #[must_use]
    pub fn is_static_param(&self, index: usize) -> bool {
        self.static_params.get(index).copied().unwrap_or(false)
    }

    /// The register carrying parameter `index`, accounting for a hidden return pointer.
    #[must_use]
    pub fn param_reg(&self, index: usize) -> Option<Reg> {
        let slot = if self.returns_via_pointer { index + 1 } else { index };
        ARG_REGS.get(slot).copied()
    }

    /// Registers a known memory range.
    pub fn add_range(&mut self, range: MemRange) {
        self.ranges.push(range);
    }

    /// The declared range covering an access, if any. Overlapping declarations resolve to
    /// the earliest registration.
    #[must_use]
    pub fn range_for(&self, addr: u64, len: u64) -> Option<&MemRange> {
        self.ranges.iter().find(|r| r.contains(addr, len))
    }

    /// True if `addr` lies inside a declared function range (an inlining candidate).
    #[must_use]
    pub fn is_function_addr(&self, addr: u64) -> bool {
        self.range_for(addr, 1)
            .is_some_and(|r| r.kind == RangeKind::Function)
    }

    /// Builder form of [`CaptureConfig::declare_static_param`], for tests and simple
    /// call sites; invalid indices are rejected at capture time instead.
    #[must_use]
    pub fn with_static_param(mut self, index: usize) -> CaptureConfig {
        let _ = self.declare_static_param(index);
        self
    }

    /// Builder form of [`CaptureConfig::add_range`].
    #[must_use]
    pub fn with_range(mut self, range: MemRange) -> CaptureConfig {
        self.add_range(range);
        self
    }

    /// Clears everything back to the non-specializing default.
    pub fn reset(&mut self) {
        *self = CaptureConfig::default();
    }
}

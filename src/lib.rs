// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # respin
//!
//! A dynamic binary rewriting engine for x86-64: decode a compiled function from process
//! memory, partially evaluate it against values known at run time, and emit a new,
//! specialized version of it as executable machine code.
//!
//! Where a traditional JIT starts from source or bytecode, `respin` starts from the
//! instructions the compiler already produced. The caller points a [`Rewriter`] at an
//! existing function, declares which of its parameters are fixed for the workload at
//! hand, and receives a function pointer to freshly generated code in which everything
//! that depended only on those parameters has been computed away: arithmetic folded,
//! branches resolved, loops unrolled, small calls inlined, constant table loads baked in
//! as immediates.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use respin::Rewriter;
//!
//! extern "C" fn poly(x: u64, c: u64) -> u64 {
//!     x * x + c
//! }
//!
//! # fn main() -> respin::Result<()> {
//! let mut rewriter = Rewriter::new()?;
//! rewriter.set_target_function(poly as usize as u64);
//! rewriter.set_param_count(2)?;
//! rewriter.declare_static_param(1)?; // c is fixed for this workload
//!
//! // SAFETY: poly is a plain compiled function matching the declared convention.
//! let specialized = unsafe { rewriter.rewrite(&[0, 5])? };
//! let f = unsafe { specialized.as_fn1() };
//! assert_eq!(unsafe { f(3) }, 14); // x*x + 5, with the add folded in
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! A rewrite runs three stages, each with its own module:
//!
//! 1. **Decode** ([`decode`]): instructions are parsed straight out of process memory
//!    into Decoded Basic Blocks, memoized per session.
//! 2. **Capture** ([`capture`]): an abstract interpreter walks the decoded code. Every
//!    register and stack slot carries a [`CaptureValue`] (a known constant, a
//!    frame-relative address, or dynamic); operations over known values fold into the
//!    state, everything else is rewritten and recorded into Captured Basic Blocks.
//!    Dynamic branches fork the walk and both sides are explored, with blocks shared
//!    whenever the same address is reached in an identical abstract state.
//! 3. **Encode** ([`codegen`]): the captured graph is laid out depth-first, rendered
//!    back into x86-64 bytes, and committed to an executable mapping.
//!
//! ## Assumptions and Failure
//!
//! The engine is deliberately conservative: anything it cannot prove it refuses to
//! specialize, and anything it cannot represent it reports rather than miscompiles.
//! All operations return [`Result`] with a descriptive [`Error`]; a failed rewrite
//! carries the faulting address and rendered instruction, and the caller simply keeps
//! using the original function. Opt-in switches trade safety for aggressiveness, e.g.
//! [`Rewriter::set_assume_known_branches`] resolves unknowable branches from the capture
//! run's concrete values, producing code that is only valid for inputs taking the same
//! paths.
//!
//! ## Scope
//!
//! The supported instruction vocabulary is the integer subset compilers emit for
//! arithmetic-heavy leaf-ish functions: moves, ALU operations, shifts, widening moves,
//! stack traffic, direct and indirect calls, and conditional branches. Floating point,
//! vector code and system instructions are out of scope and surface as
//! [`Error::Unsupported`] / [`Error::Decode`] with full context.

/// Error types and the crate-wide result alias.
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// ```rust,no_run
/// use respin::prelude::*;
///
/// let mut rewriter = Rewriter::new()?;
/// # Ok::<(), respin::Error>(())
/// ```
pub mod prelude;

/// The x86-64 instruction model shared by the decoder, emulator and encoder.
///
/// # Key Types
///
/// - [`asm::Instruction`] - A decoded or captured instruction with up to three operands
/// - [`asm::Operand`] / [`asm::MemRef`] - Register, memory and immediate operands
/// - [`asm::Reg`] - General-purpose registers by hardware encoding
/// - [`asm::Cond`] / [`asm::FlowType`] - Condition codes and control-flow classification
pub mod asm;

/// Instruction and basic-block decoding from process memory.
///
/// # Key Types
///
/// - [`decode::Decoder`] - Session decoder with a per-address block cache
/// - [`decode::DecodedBlock`] - A run of instructions ending at a control transfer
///
/// # Main Functions
///
/// - [`decode::decode_instruction`] - Decode a single instruction at an address
pub mod decode;

/// The capturing emulator: abstract interpretation that records residual code.
///
/// # Key Types
///
/// - [`capture::CaptureValue`] - Static / frame-relative / dynamic value lattice
/// - [`capture::EmuState`] - Versioned machine state with checkpoint and rollback
/// - [`capture::CaptureConfig`] - What the caller lets the engine assume
/// - [`capture::CaptureGraph`] - The specialized block graph a session produces
pub mod capture;

/// Machine-code generation and executable memory management.
///
/// # Key Types
///
/// - [`codegen::CodeStorage`] - One executable mapping shared by generated functions
pub mod codegen;

/// Handoff surface for external code generators.
///
/// # Key Types
///
/// - [`backend::DecodeSource`] - Pull decoded blocks by address
/// - [`backend::BackendRequest`] - What an external backend should produce
pub mod backend;

pub(crate) mod rewriter;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub use capture::{CaptureConfig, CaptureValue, MemRange, RangeKind};
pub use error::Error;
pub use rewriter::{Rewriter, RewrittenFn};

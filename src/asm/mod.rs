//! x86-64 instruction model: the shared vocabulary of the decoder, emulator and encoder.
//!
//! # Key Types
//! - [`Instruction`] - A decoded or captured instruction with up to three operands
//! - [`Operand`] / [`MemRef`] - Register, memory, immediate operands
//! - [`Reg`] - General-purpose registers by hardware encoding
//! - [`Mnemonic`] / [`Cond`] - Operation and condition-code vocabulary
//! - [`FlowType`] - How an instruction affects control flow
//!
//! Decoded instructions are immutable once produced and owned by the block containing them.
//! The `Display` implementations provide the diagnostic disassembly used in error messages
//! and trace logging.

mod instruction;
mod operand;
mod register;

pub use instruction::{Cond, FlowType, Instruction, Mnemonic, Width};
pub use operand::{MemRef, Operand, Segment};
pub use register::{Reg, ARG_REGS, CALLER_SAVED, GP_REGS};

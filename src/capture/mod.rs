//! The capturing emulator and its abstract machine state.
//!
//! # Key Types
//! - [`CaptureValue`] - Three-level abstract value: static, frame-relative, or dynamic
//! - [`EmuState`] - Versioned registers, stack and flags with checkpoint/rollback
//! - [`FlagState`] / [`FlagProducer`] - Symbolic flag tracking for branch folding
//! - [`CaptureConfig`] / [`MemRange`] - What the caller lets the engine assume
//! - [`CaptureGraph`] / [`CapturedBlock`] - The specialized block graph a session produces
//!
//! Capture drives the decoder through the target function while abstractly interpreting
//! every instruction. Operations over known values fold into the state; everything else
//! is rewritten and recorded into [`CapturedBlock`]s, which the encoder then renders back
//! into executable bytes.

mod block;
mod config;
mod emulator;
mod flags;
mod state;
mod value;

pub use block::{CaptureGraph, CapturedBlock, CapturedInst, CbbId};
pub use config::{CaptureConfig, MemRange, RangeKind};
pub use flags::{FlagProducer, FlagState};
pub use state::{Checkpoint, EmuState};
pub use value::CaptureValue;

pub(crate) use emulator::capture;

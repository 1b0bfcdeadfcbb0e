//! Decoded basic blocks.

use crate::asm::{FlowType, Instruction};

/// A Decoded Basic Block (DBB): the raw instruction sequence starting at one address and
/// ending at the first control-transfer instruction.
///
/// Blocks are created once per unique starting address within a rewrite session, are
/// immutable after decode, and are owned by the session's decode cache. The capturing
/// emulator walks them without re-decoding.
#[derive(Debug)]
pub struct DecodedBlock {
    /// Address of the first instruction.
    pub start: u64,
    /// Instructions in order. The last one is the control transfer that ended the block.
    pub instructions: Vec<Instruction>,
    /// The control-transfer type of the terminating instruction.
    pub exit: FlowType,
}

impl DecodedBlock {
    /// First address past the block.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.instructions.last().map_or(self.start, Instruction::end)
    }

    /// Number of instructions in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// True if the block holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

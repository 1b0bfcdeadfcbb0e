//! Captured basic blocks and the specialization graph.
//!
//! # Overview
//!
//! A Captured Basic Block (CBB) is identified by `(entry address, state id)`: the same
//! original address captured under two different abstract states yields two distinct
//! blocks, each specialized for its state. [`CaptureGraph`] owns all blocks of a session
//! in an index-addressed arena and maintains two lookup maps:
//!
//! - `by_key` finds a block by its entry pair, closing loops and sharing tails when a
//!   branch reaches an already-captured entry in an equal state.
//! - `by_instr` finds the block and instruction index at which a given original address
//!   was captured *mid-block*, enabling splits when control flow later targets an address
//!   inside an existing block.
//!
//! Splitting keeps the head under the original block id so that every established
//! predecessor link stays valid; the tail becomes a new block and inherits the head's
//! exit and successor links.

use std::collections::HashMap;

use crate::asm::{Cond, FlowType, Instruction};
use crate::{Error, Result};

/// Index of a captured block in its session's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CbbId(pub(crate) u32);

impl CbbId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One instruction in a captured block.
#[derive(Debug, Clone)]
pub struct CapturedInst {
    /// The instruction to encode, with rewritten operands.
    pub inst: Instruction,
    /// The original instruction address this was captured from. `None` for purely
    /// synthesized instructions such as stack-pointer fixups.
    pub orig: Option<u64>,
}

/// A captured basic block, specialized for one abstract state.
#[derive(Debug)]
pub struct CapturedBlock {
    /// This block's graph index.
    pub id: CbbId,
    /// Original address the block's capture started at.
    pub entry: u64,
    /// State identity at block entry.
    pub state_id: u64,
    /// The specialized instruction sequence. Branch terminators are not stored here;
    /// they are derived from `exit` during encoding.
    pub instrs: Vec<CapturedInst>,
    /// How the block ends.
    pub exit: FlowType,
    /// Condition of a `CondJump` exit.
    pub cond: Option<Cond>,
    /// Successor on the taken edge (`Jump` and `CondJump` exits).
    pub taken: Option<CbbId>,
    /// Successor on the fall-through edge (`CondJump` exits).
    pub fallthrough: Option<CbbId>,
}

/// Arena of captured blocks with entry and mid-block lookup.
#[derive(Debug, Default)]
pub struct CaptureGraph {
    blocks: Vec<CapturedBlock>,
    by_key: HashMap<(u64, u64), CbbId>,
    by_instr: HashMap<(u64, u64), (CbbId, usize)>,
    instr_count: usize,
    max_instructions: usize,
    max_blocks: usize,
}

impl CaptureGraph {
    /// An empty graph with capture capacity limits.
    #[must_use]
    pub fn new(max_instructions: usize, max_blocks: usize) -> CaptureGraph {
        CaptureGraph {
            max_instructions,
            max_blocks,
            ..CaptureGraph::default()
        }
    }

    /// Starts a new block for `(entry, state_id)` and registers it for entry lookup.
    ///
    /// # Errors
    /// Returns [`Error::CaptureOverflow`] when the block budget is exhausted.
    pub fn new_block(&mut self, entry: u64, state_id: u64) -> Result<CbbId> {
        if self.blocks.len() >= self.max_blocks {
            return Err(Error::CaptureOverflow {
                what: "captured blocks",
                limit: self.max_blocks,
            });
        }
        let id = CbbId(self.blocks.len() as u32);
        self.blocks.push(CapturedBlock {
            id,
            entry,
            state_id,
            instrs: Vec::new(),
            exit: FlowType::Invalid,
            cond: None,
            taken: None,
            fallthrough: None,
        });
        self.by_key.insert((entry, state_id), id);
        Ok(id)
    }

    /// Appends an instruction to a block, returning its index within the block.
    ///
    /// # Errors
    /// Returns [`Error::CaptureOverflow`] when the instruction budget is exhausted.
    pub fn push_inst(&mut self, block: CbbId, inst: CapturedInst) -> Result<usize> {
        if self.instr_count >= self.max_instructions {
            return Err(Error::CaptureOverflow {
                what: "captured instructions",
                limit: self.max_instructions,
            });
        }
        self.instr_count += 1;
        let instrs = &mut self.blocks[block.index()].instrs;
        instrs.push(inst);
        Ok(instrs.len() - 1)
    }

    /// Registers `(addr, state_id)` as captured at `block[index]`, if not already known.
    /// The first registration wins; convergent re-captures of the same pair are allowed
    /// and identical.
    pub fn register_instr(&mut self, addr: u64, state_id: u64, block: CbbId, index: usize) {
        self.by_instr.entry((addr, state_id)).or_insert((block, index));
    }

    /// Finds a block whose entry matches the pair.
    #[must_use]
    pub fn lookup_entry(&self, addr: u64, state_id: u64) -> Option<CbbId> {
        self.by_key.get(&(addr, state_id)).copied()
    }

    /// Finds the mid-block capture position of the pair.
    #[must_use]
    pub fn lookup_instr(&self, addr: u64, state_id: u64) -> Option<(CbbId, usize)> {
        self.by_instr.get(&(addr, state_id)).copied()
    }

    /// Splits `block` before instruction `index`, returning the tail block.
    ///
    /// The head keeps the original id and all predecessor links; the tail inherits the
    /// exit, condition and successor links, and the head is rewired to jump to the tail.
    /// Mid-block lookup entries for the moved instructions are repointed.
    ///
    /// # Errors
    /// Returns [`Error::CaptureOverflow`] when the block budget is exhausted.
    pub fn split(&mut self, block: CbbId, index: usize) -> Result<CbbId> {
        let (tail_entry, tail_sid) = {
            let head = &self.blocks[block.index()];
            let first = &head.instrs[index];
            (first.orig.unwrap_or(head.entry), head.state_id)
        };
        let tail = self.new_block(tail_entry, tail_sid)?;

        let (head_blocks, tail_blocks) = self.blocks.split_at_mut(tail.index());
        let head_block = &mut head_blocks[block.index()];
        let tail_block = &mut tail_blocks[0];

        tail_block.instrs = head_block.instrs.split_off(index);
        tail_block.exit = head_block.exit;
        tail_block.cond = head_block.cond;
        tail_block.taken = head_block.taken;
        tail_block.fallthrough = head_block.fallthrough;

        head_block.exit = FlowType::Jump;
        head_block.cond = None;
        head_block.taken = Some(tail);
        head_block.fallthrough = None;

        for (id, idx) in self.by_instr.values_mut() {
            if *id == block && *idx >= index {
                *id = tail;
                *idx -= index;
            }
        }
        Ok(tail)
    }

    /// Sets a block's exit to an unconditional jump to `target`.
    pub fn set_exit_jump(&mut self, block: CbbId, target: CbbId) {
        let b = &mut self.blocks[block.index()];
        b.exit = FlowType::Jump;
        b.cond = None;
        b.taken = Some(target);
    }

    /// Sets a block's exit to a conditional branch; successors are linked separately.
    pub fn set_exit_branch(&mut self, block: CbbId, cond: Cond) {
        let b = &mut self.blocks[block.index()];
        b.exit = FlowType::CondJump;
        b.cond = Some(cond);
    }

    /// Sets a block's exit to a function return.
    pub fn set_exit_return(&mut self, block: CbbId) {
        let b = &mut self.blocks[block.index()];
        b.exit = FlowType::Return;
        b.cond = None;
    }

    /// Links the taken edge of a branch block.
    pub fn set_taken(&mut self, block: CbbId, target: CbbId) {
        self.blocks[block.index()].taken = Some(target);
    }

    /// Links the fall-through edge of a branch block.
    pub fn set_fallthrough(&mut self, block: CbbId, target: CbbId) {
        self.blocks[block.index()].fallthrough = Some(target);
    }

    /// The entry block of the capture (the first one created).
    #[must_use]
    pub fn entry(&self) -> CbbId {
        CbbId(0)
    }

    /// A block by id.
    #[must_use]
    pub fn block(&self, id: CbbId) -> &CapturedBlock {
        &self.blocks[id.index()]
    }

    /// All blocks, in creation order.
    #[must_use]
    pub fn blocks(&self) -> &[CapturedBlock] {
        &self.blocks
    }

    /// Total captured instructions across all blocks.
    #[must_use]
    pub fn instr_count(&self) -> usize {
        self.instr_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Mnemonic, Operand, Reg, Width};

    fn inst(addr: u64) -> CapturedInst {
        CapturedInst {
            inst: Instruction::binary(
                addr,
                Mnemonic::Add,
                Width::W64,
                Operand::Reg(Reg::Rax),
                Operand::Imm(1),
            ),
            orig: Some(addr),
        }
    }

    fn graph() -> CaptureGraph {
        CaptureGraph::new(64, 16)
    }

    #[test]
    fn entry_lookup_distinguishes_states() {
        let mut g = graph();
        let a = g.new_block(0x1000, 1).unwrap();
        let b = g.new_block(0x1000, 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(g.lookup_entry(0x1000, 1), Some(a));
        assert_eq!(g.lookup_entry(0x1000, 2), Some(b));
        assert_eq!(g.lookup_entry(0x1000, 3), None);
    }

    #[test]
    fn split_moves_tail_and_relinks() {
        let mut g = graph();
        let b = g.new_block(0x1000, 1).unwrap();
        for (i, addr) in [0x1000u64, 0x1004, 0x1008, 0x100c].iter().enumerate() {
            let idx = g.push_inst(b, inst(*addr)).unwrap();
            g.register_instr(*addr, 1, b, idx);
            assert_eq!(idx, i);
        }
        g.set_exit_return(b);

        let tail = g.split(b, 2).unwrap();
        let head = g.block(b);
        assert_eq!(head.instrs.len(), 2);
        assert_eq!(head.exit, FlowType::Jump);
        assert_eq!(head.taken, Some(tail));

        let tail_block = g.block(tail);
        assert_eq!(tail_block.instrs.len(), 2);
        assert_eq!(tail_block.entry, 0x1008);
        assert_eq!(tail_block.exit, FlowType::Return);

        // Mid-block lookups repointed into the tail.
        assert_eq!(g.lookup_instr(0x1008, 1), Some((tail, 0)));
        assert_eq!(g.lookup_instr(0x100c, 1), Some((tail, 1)));
        assert_eq!(g.lookup_instr(0x1000, 1), Some((b, 0)));
    }

    #[test]
    fn split_preserves_branch_exit_on_tail() {
        let mut g = graph();
        let b = g.new_block(0x1000, 1).unwrap();
        let other = g.new_block(0x2000, 1).unwrap();
        g.push_inst(b, inst(0x1000)).unwrap();
        g.push_inst(b, inst(0x1004)).unwrap();
        g.set_exit_branch(b, Cond::E);
        g.set_taken(b, other);
        g.set_fallthrough(b, other);

        let tail = g.split(b, 1).unwrap();
        assert_eq!(g.block(tail).exit, FlowType::CondJump);
        assert_eq!(g.block(tail).cond, Some(Cond::E));
        assert_eq!(g.block(tail).taken, Some(other));
        assert_eq!(g.block(b).exit, FlowType::Jump);
        assert_eq!(g.block(b).cond, None);
    }

    #[test]
    fn instruction_budget_is_enforced() {
        let mut g = CaptureGraph::new(2, 16);
        let b = g.new_block(0x1000, 1).unwrap();
        g.push_inst(b, inst(0x1000)).unwrap();
        g.push_inst(b, inst(0x1004)).unwrap();
        let err = g.push_inst(b, inst(0x1008)).unwrap_err();
        assert!(matches!(err, Error::CaptureOverflow { limit: 2, .. }));
    }

    #[test]
    fn block_budget_is_enforced() {
        let mut g = CaptureGraph::new(64, 1);
        g.new_block(0x1000, 1).unwrap();
        assert!(matches!(
            g.new_block(0x2000, 1),
            Err(Error::CaptureOverflow { limit: 1, .. })
        ));
    }
}

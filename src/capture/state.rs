//! Versioned abstract machine state.
//!
//! # Overview
//!
//! [`EmuState`] holds the abstract contents of the sixteen general-purpose registers, the
//! tracked stack slots and the flag producer during capture. Every mutable location is a
//! [`Slot`]: a baseline value plus a history of `(generation, value)` entries. Taking a
//! [`Checkpoint`] bumps the generation counter; restoring one truncates every history back
//! past that generation, which is what lets the emulator fork at an unresolved conditional
//! branch, finish the fall-through path and then rewind to explore the taken path from the
//! exact branch-point state.
//!
//! # State identity
//!
//! [`EmuState::state_id`] condenses the folding-relevant portion of the state into a hash.
//! Two visits to the same address with equal state ids are guaranteed to specialize
//! identically, so the capture graph can close loops and share tails on `(address, state
//! id)`. Sample values and sampled flag producers never enter the hash; dynamic stack slots
//! and a dynamic flag producer hash as their canonical unknown forms.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::asm::{Reg, Width};
use crate::capture::flags::FlagState;
use crate::capture::value::CaptureValue;

type Gen = u32;

/// A rewind point returned by [`EmuState::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(Gen);

/// One versioned storage location.
#[derive(Debug, Clone)]
struct Slot<T> {
    base: T,
    history: Vec<(Gen, T)>,
}

impl<T: Clone> Slot<T> {
    fn new(base: T) -> Slot<T> {
        Slot {
            base,
            history: Vec::new(),
        }
    }

    fn get(&self) -> &T {
        self.history.last().map_or(&self.base, |(_, v)| v)
    }

    fn set(&mut self, gen: Gen, value: T) {
        if let Some((top_gen, top)) = self.history.last_mut() {
            if *top_gen == gen {
                *top = value;
                return;
            }
        }
        self.history.push((gen, value));
    }

    fn rollback(&mut self, gen: Gen) {
        while self.history.last().is_some_and(|(g, _)| *g > gen) {
            self.history.pop();
        }
    }
}

/// Contents of one 8-byte-aligned stack slot.
type StackSlot = CaptureValue;

/// The abstract machine state of one capture session.
///
/// Stack offsets are relative to the entry RSP (offset 0 is the return address slot;
/// locals live at negative offsets) and are tracked in 8-byte-aligned slots.
#[derive(Debug)]
pub struct EmuState {
    gen: Gen,
    regs: Vec<Slot<CaptureValue>>,
    /// Per-register: does the run-time register currently hold the static value? Cleared
    /// by folded writes, set by materialization.
    synced: Vec<Slot<bool>>,
    /// Concrete shadow values from the capture run's actual arguments. Carried for every
    /// register whose value chain stayed computable; never part of state identity.
    samples: Vec<Slot<Option<u64>>>,
    stack: BTreeMap<i64, Slot<StackSlot>>,
    flags: Slot<FlagState>,
    /// RSP delta the *emitted* code is at, relative to entry RSP. Diverges from the
    /// emulated delta when pushes fold away.
    emitted_sp: Slot<i64>,
    call_depth: Slot<u32>,
}

impl EmuState {
    /// Fresh state: every register dynamic, RSP at the entry frame, empty stack, flags
    /// unknown.
    #[must_use]
    pub fn new() -> EmuState {
        let mut state = EmuState {
            gen: 0,
            regs: (0..16).map(|_| Slot::new(CaptureValue::Dynamic)).collect(),
            synced: (0..16).map(|_| Slot::new(false)).collect(),
            samples: (0..16).map(|_| Slot::new(None)).collect(),
            stack: BTreeMap::new(),
            flags: Slot::new(FlagState::unknown()),
            emitted_sp: Slot::new(0),
            call_depth: Slot::new(0),
        };
        state.regs[usize::from(Reg::Rsp.index())] = Slot::new(CaptureValue::StackRel(0));
        state
    }

    /// Abstract value of a register.
    #[must_use]
    pub fn reg(&self, reg: Reg) -> CaptureValue {
        *self.regs[usize::from(reg.index())].get()
    }

    /// Sets a register's abstract value. A folded (non-materialized) write clears the
    /// synced bit; emitted writes leave the run-time register authoritative anyway.
    pub fn set_reg(&mut self, reg: Reg, value: CaptureValue) {
        self.regs[usize::from(reg.index())].set(self.gen, value);
        self.synced[usize::from(reg.index())].set(self.gen, false);
    }

    /// Concrete shadow value of a register, if one survived the value chain.
    #[must_use]
    pub fn sample(&self, reg: Reg) -> Option<u64> {
        *self.samples[usize::from(reg.index())].get()
    }

    /// Sets or clears a register's concrete shadow value.
    pub fn set_sample(&mut self, reg: Reg, value: Option<u64>) {
        self.samples[usize::from(reg.index())].set(self.gen, value);
    }

    /// True if the run-time register already holds the static value tracked for it.
    #[must_use]
    pub fn is_synced(&self, reg: Reg) -> bool {
        *self.synced[usize::from(reg.index())].get()
    }

    /// Marks the run-time register as holding its tracked static value.
    pub fn mark_synced(&mut self, reg: Reg) {
        self.synced[usize::from(reg.index())].set(self.gen, true);
    }

    /// The emulated RSP delta relative to entry, if RSP is still frame-relative.
    #[must_use]
    pub fn sp_delta(&self) -> Option<i64> {
        match self.reg(Reg::Rsp) {
            CaptureValue::StackRel(d) => Some(d),
            CaptureValue::Static(_) | CaptureValue::Dynamic => None,
        }
    }

    /// The RSP delta the emitted code is currently at.
    #[must_use]
    pub fn emitted_sp(&self) -> i64 {
        *self.emitted_sp.get()
    }

    /// Sets the emitted-code RSP delta.
    pub fn set_emitted_sp(&mut self, delta: i64) {
        self.emitted_sp.set(self.gen, delta);
    }

    /// Current call inlining depth.
    #[must_use]
    pub fn call_depth(&self) -> u32 {
        *self.call_depth.get()
    }

    /// Sets the call inlining depth.
    pub fn set_call_depth(&mut self, depth: u32) {
        self.call_depth.set(self.gen, depth);
    }

    /// The current flag state.
    #[must_use]
    pub fn flags(&self) -> FlagState {
        *self.flags.get()
    }

    /// Replaces the flag state.
    pub fn set_flags(&mut self, flags: FlagState) {
        self.flags.set(self.gen, flags);
    }

    /// Reads `width` bytes at the given entry-relative stack offset.
    ///
    /// Returns the folded value when the covering slot was statically tracked, otherwise
    /// Dynamic. A frame-relative slot value can only be read back at full width.
    #[must_use]
    pub fn stack_read(&self, offset: i64, width: Width) -> CaptureValue {
        let slot_off = offset & !7;
        let end = offset + i64::from(width.bytes());
        if end > slot_off + 8 {
            // Straddles two slots; not tracked.
            return CaptureValue::Dynamic;
        }
        let slot = match self.stack.get(&slot_off) {
            Some(s) => *s.get(),
            None => return CaptureValue::Dynamic,
        };
        match slot {
            CaptureValue::Static(v) => {
                let shift = (offset - slot_off) as u32 * 8;
                CaptureValue::Static((v >> shift) & width.mask())
            }
            CaptureValue::StackRel(d) if width == Width::W64 => CaptureValue::StackRel(d),
            CaptureValue::StackRel(_) | CaptureValue::Dynamic => CaptureValue::Dynamic,
        }
    }

    /// The tracked value of the whole slot covering an offset.
    #[must_use]
    pub fn stack_slot(&self, offset: i64) -> CaptureValue {
        self.stack
            .get(&(offset & !7))
            .map_or(CaptureValue::Dynamic, |s| *s.get())
    }

    /// Records a full-width store of a known value at an aligned offset. The caller must
    /// have verified alignment and width; this only bookkeeps.
    pub fn stack_write_slot(&mut self, slot_offset: i64, value: CaptureValue) {
        let gen = self.gen;
        self.stack
            .entry(slot_offset)
            .or_insert_with(|| Slot::new(CaptureValue::Dynamic))
            .set(gen, value);
    }

    /// Marks every slot overlapped by a `width`-byte store at `offset` as dynamic.
    pub fn stack_clobber(&mut self, offset: i64, width: Width) {
        let first = offset & !7;
        let last = (offset + i64::from(width.bytes()) - 1) & !7;
        let mut slot_off = first;
        while slot_off <= last {
            self.stack_write_slot(slot_off, CaptureValue::Dynamic);
            slot_off += 8;
        }
    }

    /// Takes a rewind point. Writes after this call can be undone with
    /// [`EmuState::restore`].
    pub fn checkpoint(&mut self) -> Checkpoint {
        let mark = self.gen;
        self.gen += 1;
        Checkpoint(mark)
    }

    /// Rewinds the state to a checkpoint. Checkpoints must be restored newest-first.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        let Checkpoint(mark) = checkpoint;
        for slot in &mut self.regs {
            slot.rollback(mark);
        }
        for slot in &mut self.synced {
            slot.rollback(mark);
        }
        for slot in &mut self.samples {
            slot.rollback(mark);
        }
        for slot in self.stack.values_mut() {
            slot.rollback(mark);
        }
        self.flags.rollback(mark);
        self.emitted_sp.rollback(mark);
        self.call_depth.rollback(mark);
        self.gen = mark + 1;
    }

    /// Hashes the folding-relevant state into a stable identity.
    #[must_use]
    pub fn state_id(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (i, slot) in self.regs.iter().enumerate() {
            let value = *slot.get();
            value.hash(&mut hasher);
            // The synced bit only matters where there is a static value to be in sync
            // with.
            if value.is_known() {
                self.synced[i].get().hash(&mut hasher);
            }
        }
        // BTreeMap iterates in offset order, so the hash is deterministic. Dynamic slots
        // are indistinguishable from absent ones.
        for (offset, slot) in &self.stack {
            let value = *slot.get();
            if value != CaptureValue::Dynamic {
                offset.hash(&mut hasher);
                value.hash(&mut hasher);
            }
        }
        self.flags.get().known.hash(&mut hasher);
        self.emitted_sp.get().hash(&mut hasher);
        self.call_depth.get().hash(&mut hasher);
        hasher.finish()
    }

}

impl Default for EmuState {
    fn default() -> Self {
        EmuState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_frame_relative_rsp() {
        let state = EmuState::new();
        assert_eq!(state.reg(Reg::Rsp), CaptureValue::StackRel(0));
        assert_eq!(state.reg(Reg::Rax), CaptureValue::Dynamic);
        assert_eq!(state.sp_delta(), Some(0));
    }

    #[test]
    fn checkpoint_restore_rewinds_registers() {
        let mut state = EmuState::new();
        state.set_reg(Reg::Rax, CaptureValue::Static(1));
        let cp = state.checkpoint();
        state.set_reg(Reg::Rax, CaptureValue::Static(2));
        state.set_reg(Reg::Rbx, CaptureValue::Static(3));
        assert_eq!(state.reg(Reg::Rax), CaptureValue::Static(2));
        state.restore(cp);
        assert_eq!(state.reg(Reg::Rax), CaptureValue::Static(1));
        assert_eq!(state.reg(Reg::Rbx), CaptureValue::Dynamic);
    }

    #[test]
    fn nested_checkpoints_restore_in_lifo_order() {
        let mut state = EmuState::new();
        state.set_reg(Reg::Rcx, CaptureValue::Static(10));
        let outer = state.checkpoint();
        state.set_reg(Reg::Rcx, CaptureValue::Static(20));
        let inner = state.checkpoint();
        state.set_reg(Reg::Rcx, CaptureValue::Static(30));
        state.restore(inner);
        assert_eq!(state.reg(Reg::Rcx), CaptureValue::Static(20));
        state.restore(outer);
        assert_eq!(state.reg(Reg::Rcx), CaptureValue::Static(10));
    }

    #[test]
    fn restore_rewinds_stack_slots() {
        let mut state = EmuState::new();
        state.stack_write_slot(-8, CaptureValue::Static(7));
        let cp = state.checkpoint();
        state.stack_write_slot(-8, CaptureValue::Dynamic);
        state.stack_write_slot(-16, CaptureValue::Static(9));
        state.restore(cp);
        assert_eq!(state.stack_slot(-8), CaptureValue::Static(7));
        assert_eq!(state.stack_slot(-16), CaptureValue::Dynamic);
    }

    #[test]
    fn narrow_stack_reads_extract_bytes() {
        let mut state = EmuState::new();
        state.stack_write_slot(-8, CaptureValue::Static(0x1122_3344_5566_7788));
        assert_eq!(
            state.stack_read(-8, Width::W32),
            CaptureValue::Static(0x5566_7788)
        );
        assert_eq!(
            state.stack_read(-4, Width::W32),
            CaptureValue::Static(0x1122_3344)
        );
        assert_eq!(state.stack_read(-7, Width::W8), CaptureValue::Static(0x77));
        // Straddling two slots is not tracked.
        assert_eq!(state.stack_read(-4, Width::W64), CaptureValue::Dynamic);
    }

    #[test]
    fn state_id_ignores_samples_and_dynamic_stack_slots() {
        let mut a = EmuState::new();
        let mut b = EmuState::new();
        a.set_sample(Reg::Rdi, Some(42));
        b.stack_write_slot(-8, CaptureValue::Dynamic);
        assert_eq!(a.state_id(), b.state_id());
    }

    #[test]
    fn state_id_tracks_static_values() {
        let mut a = EmuState::new();
        let b = EmuState::new();
        a.set_reg(Reg::Rdi, CaptureValue::Static(1));
        assert_ne!(a.state_id(), b.state_id());
        a.set_reg(Reg::Rdi, CaptureValue::Dynamic);
        assert_eq!(a.state_id(), b.state_id());
    }

    #[test]
    fn state_id_sees_synced_bit_only_for_known_values() {
        let mut a = EmuState::new();
        a.set_reg(Reg::Rax, CaptureValue::Static(5));
        let before = a.state_id();
        a.mark_synced(Reg::Rax);
        assert_ne!(a.state_id(), before);

        // For a dynamic register the bit is meaningless and ignored.
        let mut c = EmuState::new();
        let base = c.state_id();
        c.mark_synced(Reg::Rbx);
        assert_eq!(c.state_id(), base);
    }
}

//! The capturing emulator: abstract interpretation that records residual code.
//!
//! # Overview
//!
//! The emulator walks decoded blocks instruction by instruction, tracking every register
//! and stack slot as a [`CaptureValue`]. An operation whose inputs are all known folds:
//! it updates the abstract state and captures nothing. An operation with a dynamic input
//! is captured into the current block, with known operands substituted as immediates or
//! materialized into their registers first. The captured graph that falls out is the
//! original function specialized for the configured static inputs.
//!
//! # Stack handling
//!
//! Folded pushes and stores make the emulated stack pointer diverge from the one the
//! generated code will actually have. The emulator tracks both deltas and compensates:
//! frame-relative memory operands are rewritten against the emitted stack pointer,
//! pushes and pops under skew lower to plain moves, and an explicit adjustment is
//! emitted before anything that exposes the real stack pointer (an opaque call or the
//! final return).
//!
//! # Branches
//!
//! A conditional branch over known flags folds into straight-line code. Over dynamic
//! flags it ends the block, the fall-through path is explored immediately, and the taken
//! side is pushed onto a worklist together with a [`Checkpoint`] of the exact
//! branch-point state, to be rewound and explored afterwards.

use log::trace;

use crate::asm::{
    Cond, Instruction, MemRef, Mnemonic, Operand, Reg, Width, ARG_REGS, CALLER_SAVED,
};
use crate::capture::block::{CaptureGraph, CapturedInst, CbbId};
use crate::capture::config::{CaptureConfig, RangeKind};
use crate::capture::flags::{FlagProducer, FlagState};
use crate::capture::state::{Checkpoint, EmuState};
use crate::capture::value::{self, CaptureValue};
use crate::decode::Decoder;
use crate::{Error, Result};

/// How one emulated instruction redirects the capture walk.
enum Flow {
    /// Fall through to the next instruction.
    Continue,
    /// Continue at a resolved address (folded jump, inlined call, inlined return).
    Goto(u64),
    /// Unresolved conditional branch: capture it and explore both sides.
    Branch {
        cond: Cond,
        taken: u64,
        fall: u64,
    },
    /// The outermost return was captured; the path is complete.
    Done,
}

/// Where a resolved abstract address points.
enum MemClass {
    /// Entry-relative stack location.
    Stack(i64),
    /// Absolute address known at capture time.
    Global(u64),
    /// Only known at run time.
    Dynamic,
}

/// Whether a known value may be substituted as an immediate operand.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ImmPolicy {
    /// The instruction has no immediate form at this operand.
    Forbid,
    /// Substitute if the value fits the sign-extended imm32 of the operation width.
    Fit,
    /// Substitute any value (`mov reg, imm64` exists).
    Any,
}

/// An unexplored taken edge, with the state to rewind to.
struct PendingBranch {
    target: u64,
    checkpoint: Checkpoint,
    from: CbbId,
}

/// Registration bookkeeping for the instruction currently being emulated: the first
/// capture it produces (materialization prelude included) marks where this original
/// address lives in the graph.
struct RegMark {
    addr: u64,
    state_id: u64,
    registered: bool,
}

/// One capture session over a configured decoder.
struct Emulator<'a> {
    decoder: &'a mut Decoder,
    config: &'a CaptureConfig,
    graph: CaptureGraph,
    state: EmuState,
    pending: Vec<PendingBranch>,
    mark: Option<RegMark>,
    steps: usize,
    max_steps: usize,
}

/// Runs a capture session and returns the specialized block graph.
pub(crate) fn capture(
    decoder: &mut Decoder,
    config: &CaptureConfig,
    entry: u64,
    args: &[u64],
    max_instructions: usize,
    max_blocks: usize,
) -> Result<CaptureGraph> {
    let mut emu = Emulator {
        decoder,
        config,
        graph: CaptureGraph::new(max_instructions, max_blocks),
        state: EmuState::new(),
        pending: Vec::new(),
        mark: None,
        steps: 0,
        // Folding can visit far more instructions than it captures; this only guards
        // against non-terminating fully-static loops.
        max_steps: max_instructions.saturating_mul(64),
    };
    emu.seed_params(args)?;
    emu.run(entry)
}

impl Emulator<'_> {
    fn seed_params(&mut self, args: &[u64]) -> Result<()> {
        for index in 0..self.config.param_count {
            let reg = self.config.param_reg(index).ok_or_else(|| {
                Error::Config(format!(
                    "parameter {index} has no register with a hidden return pointer in play"
                ))
            })?;
            let arg = *args.get(index).ok_or_else(|| {
                Error::Config(format!(
                    "{} arguments supplied for {} declared parameters",
                    args.len(),
                    self.config.param_count
                ))
            })?;
            self.state.set_sample(reg, Some(arg));
            if self.config.is_static_param(index) {
                self.state.set_reg(reg, CaptureValue::Static(arg));
                self.state.set_sample(reg, Some(arg));
            }
        }
        Ok(())
    }

    fn run(mut self, entry: u64) -> Result<CaptureGraph> {
        let sid = self.state.state_id();
        let first = self.graph.new_block(entry, sid)?;
        self.run_path(entry, first)?;
        while let Some(branch) = self.pending.pop() {
            self.state.restore(branch.checkpoint);
            let (hit, from) = self.lookup_or_split(branch.target, branch.from)?;
            match hit {
                Some(id) => self.graph.set_taken(from, id),
                None => {
                    let id = self.graph.new_block(branch.target, self.state.state_id())?;
                    self.graph.set_taken(from, id);
                    self.run_path(branch.target, id)?;
                }
            }
        }
        Ok(self.graph)
    }

    /// Emulates one path to its return, forking pending work at dynamic branches.
    fn run_path(&mut self, mut pc: u64, mut block: CbbId) -> Result<()> {
        'path: loop {
            let dbb = self.decoder.decode(pc)?;
            for inst in &dbb.instructions {
                match self.step(block, inst)? {
                    Flow::Continue => {}
                    Flow::Goto(target) => {
                        let (hit, current) = self.lookup_or_split(target, block)?;
                        block = current;
                        if let Some(id) = hit {
                            self.graph.set_exit_jump(block, id);
                            return Ok(());
                        }
                        // Unconditional flow to fresh territory continues in the same
                        // captured block.
                        pc = target;
                        continue 'path;
                    }
                    Flow::Branch { cond, taken, fall } => {
                        self.graph.set_exit_branch(block, cond);
                        let checkpoint = self.state.checkpoint();
                        self.pending.push(PendingBranch {
                            target: taken,
                            checkpoint,
                            from: block,
                        });
                        let (hit, current) = self.lookup_or_split(fall, block)?;
                        block = current;
                        if let Some(id) = hit {
                            self.graph.set_fallthrough(block, id);
                            return Ok(());
                        }
                        let next = self.graph.new_block(fall, self.state.state_id())?;
                        self.graph.set_fallthrough(block, next);
                        block = next;
                        pc = fall;
                        continue 'path;
                    }
                    Flow::Done => return Ok(()),
                }
            }
            // The decoded block ended in a call that was captured opaquely; execution
            // continues right after it.
            pc = dbb.end();
        }
    }

    /// Looks up the current state at `addr` among captured entries, splitting a block
    /// when the address was captured mid-block. Returns the link target (if any) and the
    /// possibly-reassigned current block (a split can move the current block's open end
    /// into the tail).
    fn lookup_or_split(&mut self, addr: u64, current: CbbId) -> Result<(Option<CbbId>, CbbId)> {
        let sid = self.state.state_id();
        if let Some(id) = self.graph.lookup_entry(addr, sid) {
            return Ok((Some(id), current));
        }
        if let Some((id, index)) = self.graph.lookup_instr(addr, sid) {
            if index == 0 {
                return Ok((Some(id), current));
            }
            let tail = self.split_block(id, index)?;
            let current = if id == current { tail } else { current };
            return Ok((Some(tail), current));
        }
        Ok((None, current))
    }

    fn split_block(&mut self, block: CbbId, index: usize) -> Result<CbbId> {
        let tail = self.graph.split(block, index)?;
        // The branch terminator of a split block lives in its tail now.
        for pending in &mut self.pending {
            if pending.from == block {
                pending.from = tail;
            }
        }
        Ok(tail)
    }

    fn step(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(Error::CaptureOverflow {
                what: "emulated instructions",
                limit: self.max_steps,
            });
        }
        self.mark = Some(RegMark {
            addr: inst.address,
            state_id: self.state.state_id(),
            registered: false,
        });
        if self.config.trace_capture {
            trace!("emulate {:#x}: {}", inst.address, inst);
        }
        match inst.mnemonic {
            Mnemonic::Nop => Ok(Flow::Continue),
            Mnemonic::Mov => self.do_mov(block, inst),
            Mnemonic::Movzx | Mnemonic::Movsx => self.do_extend(block, inst),
            Mnemonic::Lea => self.do_lea(block, inst),
            Mnemonic::Xchg => self.do_xchg(block, inst),
            Mnemonic::Push => self.do_push(block, inst),
            Mnemonic::Pop => self.do_pop(block, inst),
            Mnemonic::Leave => self.do_leave(block, inst),
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Imul => self.do_alu(block, inst),
            Mnemonic::Cmp | Mnemonic::Test => self.do_compare(block, inst),
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => self.do_shift(block, inst),
            Mnemonic::Neg | Mnemonic::Not | Mnemonic::Inc | Mnemonic::Dec => {
                self.do_unary(block, inst)
            }
            Mnemonic::Cdq | Mnemonic::Cqo | Mnemonic::Cdqe => self.do_convert(block, inst),
            Mnemonic::Jmp => self.do_jmp(inst),
            Mnemonic::Jcc => self.do_jcc(inst),
            Mnemonic::Call => self.do_call(block, inst),
            Mnemonic::Ret => self.do_ret(block, inst),
        }
    }

    // ---- value access -------------------------------------------------------------

    fn assumption(&self, inst: &Instruction, message: impl Into<String>) -> Error {
        Error::Assumption {
            address: inst.address,
            message: message.into(),
        }
    }

    fn unsupported(&self, inst: &Instruction) -> Error {
        Error::Unsupported {
            address: inst.address,
            text: inst.to_string(),
        }
    }

    fn forced(&self) -> bool {
        self.config
            .force_unknown_depth
            .is_some_and(|depth| self.state.call_depth() >= depth)
    }

    fn classify(addr: CaptureValue) -> MemClass {
        match addr {
            CaptureValue::StackRel(offset) => MemClass::Stack(offset),
            CaptureValue::Static(a) => MemClass::Global(a),
            CaptureValue::Dynamic => MemClass::Dynamic,
        }
    }

    /// Resolves a memory operand to an abstract address.
    fn resolve_mem(&self, mem: &MemRef, inst_end: u64) -> CaptureValue {
        if mem.segment.is_some() {
            // fs/gs bases are invisible to the capture.
            return CaptureValue::Dynamic;
        }
        if mem.rip_relative {
            return CaptureValue::Static(inst_end.wrapping_add(mem.disp as i64 as u64));
        }
        let mut addr = match mem.base {
            Some(base) => self.state.reg(base),
            None => CaptureValue::Static(0),
        };
        if let Some(index) = mem.index {
            let scaled = match self.state.reg(index) {
                CaptureValue::Static(v) => v.wrapping_mul(u64::from(mem.scale)),
                // A frame-relative or dynamic index defeats static resolution.
                _ => return CaptureValue::Dynamic,
            };
            addr = add_known(addr, scaled as i64);
        }
        add_known(addr, i64::from(mem.disp))
    }

    /// Reads an operand as (abstract value, concrete shadow sample).
    fn read_operand(
        &self,
        inst: &Instruction,
        op: &Operand,
        width: Width,
    ) -> Result<(CaptureValue, Option<u64>)> {
        match op {
            Operand::None => Err(self.unsupported(inst)),
            Operand::Imm(v) => Ok((CaptureValue::Static(*v as u64), Some(*v as u64))),
            Operand::Reg(r) => Ok((self.state.reg(*r), self.state.sample(*r))),
            Operand::Mem(mem) => {
                let addr = self.resolve_mem(mem, inst.end());
                match Self::classify(addr) {
                    MemClass::Stack(offset) => {
                        let v = self.state.stack_read(offset, width);
                        Ok((v, v.as_static()))
                    }
                    MemClass::Global(a) => {
                        let is_const = self
                            .config
                            .range_for(a, u64::from(width.bytes()))
                            .is_some_and(|r| r.kind == RangeKind::ConstData);
                        if is_const {
                            let v = read_global(a, width);
                            Ok((CaptureValue::Static(v), Some(v)))
                        } else {
                            Ok((CaptureValue::Dynamic, None))
                        }
                    }
                    MemClass::Dynamic => Ok((CaptureValue::Dynamic, None)),
                }
            }
        }
    }

    // ---- register writes ----------------------------------------------------------

    fn can_fold_reg_write(&self, reg: Reg, width: Width, result: CaptureValue) -> bool {
        if self.forced() {
            return false;
        }
        match result {
            CaptureValue::Dynamic => false,
            CaptureValue::StackRel(_) => width == Width::W64,
            CaptureValue::Static(_) => match width {
                Width::W64 | Width::W32 => true,
                // A narrow write merges with the old contents, which must be known too.
                Width::W8 | Width::W16 => self.state.reg(reg).is_static(),
            },
        }
    }

    fn merge_sample(&self, reg: Reg, width: Width, sample: Option<u64>) -> Option<u64> {
        match width {
            Width::W64 => sample,
            Width::W32 => sample.map(|v| v & Width::W32.mask()),
            Width::W8 | Width::W16 => self
                .state
                .sample(reg)
                .zip(sample)
                .map(|(old, new)| (old & !width.mask()) | (new & width.mask())),
        }
    }

    /// Records a folded register write: nothing is captured, knowledge replaces code.
    fn fold_write_reg(
        &mut self,
        inst: &Instruction,
        reg: Reg,
        width: Width,
        result: CaptureValue,
        sample: Option<u64>,
    ) -> Result<()> {
        let merged = match result {
            CaptureValue::Static(v) => value::merge_write(self.state.reg(reg), v, width),
            CaptureValue::StackRel(d) if width == Width::W64 => CaptureValue::StackRel(d),
            _ => CaptureValue::Dynamic,
        };
        if reg == Reg::Rsp && !matches!(merged, CaptureValue::StackRel(_)) {
            return Err(self.assumption(
                inst,
                "stack pointer updated with a value that is not frame-relative",
            ));
        }
        let merged_sample = self.merge_sample(reg, width, sample);
        self.state.set_reg(reg, merged);
        self.state.set_sample(reg, merged_sample);
        Ok(())
    }

    /// Records that a captured instruction wrote the register at run time.
    fn emitted_write_reg(
        &mut self,
        inst: &Instruction,
        reg: Reg,
        width: Width,
        sample: Option<u64>,
    ) -> Result<()> {
        if reg == Reg::Rsp {
            return Err(self.assumption(inst, "stack pointer written by a dynamic operation"));
        }
        let merged_sample = self.merge_sample(reg, width, sample);
        self.state.set_reg(reg, CaptureValue::Dynamic);
        self.state.set_sample(reg, merged_sample);
        Ok(())
    }

    // ---- emission -----------------------------------------------------------------

    fn emit(&mut self, block: CbbId, inst: Instruction) -> Result<()> {
        if self.config.trace_capture {
            trace!("capture {:#x}: {}", inst.address, inst);
        }
        let orig = self.mark.as_ref().map(|m| m.addr);
        let index = self.graph.push_inst(block, CapturedInst { inst, orig })?;
        if let Some(mark) = self.mark.as_mut() {
            if !mark.registered {
                self.graph.register_instr(mark.addr, mark.state_id, block, index);
                mark.registered = true;
            }
        }
        Ok(())
    }

    /// Emits the move or address computation that puts a known register value into its
    /// run-time register, if it is not there already.
    fn materialize(&mut self, block: CbbId, at: u64, reg: Reg) -> Result<()> {
        if self.state.is_synced(reg) {
            return Ok(());
        }
        match self.state.reg(reg) {
            CaptureValue::Static(v) => {
                self.emit(block, Instruction::mov_reg_imm(at, reg, v as i64))?;
                self.state.mark_synced(reg);
            }
            CaptureValue::StackRel(offset) => {
                let disp = self.frame_disp(at, offset)?;
                self.emit(
                    block,
                    Instruction::binary(
                        at,
                        Mnemonic::Lea,
                        Width::W64,
                        Operand::Reg(reg),
                        Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                    ),
                )?;
                self.state.mark_synced(reg);
            }
            CaptureValue::Dynamic => {}
        }
        Ok(())
    }

    /// Emits the stack-pointer adjustment that brings the generated code's RSP to the
    /// emulated delta.
    fn sync_sp(&mut self, block: CbbId, at: u64) -> Result<()> {
        let target = self.state.sp_delta().ok_or(Error::Assumption {
            address: at,
            message: "stack pointer is no longer frame-relative".into(),
        })?;
        let current = self.state.emitted_sp();
        if current != target {
            let fix = i32::try_from(target - current).map_err(|_| {
                Error::Encode(format!(
                    "stack adjustment {} out of range at {at:#x}",
                    target - current
                ))
            })?;
            self.emit(
                block,
                Instruction::binary(
                    at,
                    Mnemonic::Lea,
                    Width::W64,
                    Operand::Reg(Reg::Rsp),
                    Operand::Mem(MemRef::base_disp(Reg::Rsp, fix)),
                ),
            )?;
            self.state.set_emitted_sp(target);
        }
        Ok(())
    }

    /// Makes a register operand live before a captured instruction reads it.
    fn prepare_read_reg(&mut self, block: CbbId, inst: &Instruction, reg: Reg) -> Result<()> {
        if reg == Reg::Rsp {
            if self.state.sp_delta().is_some() {
                self.sync_sp(block, inst.address)?;
            }
            return Ok(());
        }
        self.materialize(block, inst.address, reg)
    }

    /// Displacement of an entry-relative offset against the emitted stack pointer.
    fn frame_disp(&self, at: u64, offset: i64) -> Result<i32> {
        i32::try_from(offset - self.state.emitted_sp()).map_err(|_| {
            Error::Encode(format!(
                "frame offset {offset:#x} out of displacement range at {at:#x}"
            ))
        })
    }

    /// Rewrites a source operand for emission: known registers become immediates (policy
    /// permitting) or get materialized; memory references are rebased.
    fn rewrite_src(
        &mut self,
        block: CbbId,
        inst: &Instruction,
        op: &Operand,
        width: Width,
        policy: ImmPolicy,
    ) -> Result<(Operand, Option<u64>)> {
        match op {
            Operand::None => Ok((Operand::None, None)),
            Operand::Imm(v) => Ok((Operand::Imm(*v), None)),
            Operand::Reg(r) => {
                let r = *r;
                if let CaptureValue::Static(v) = self.state.reg(r) {
                    if !self.state.is_synced(r) {
                        match policy {
                            ImmPolicy::Any => return Ok((Operand::Imm(v as i64), None)),
                            ImmPolicy::Fit if value::fits_imm(v, width) => {
                                return Ok((Operand::Imm(value::sign_extend(v, width)), None));
                            }
                            _ => {}
                        }
                    }
                }
                self.prepare_read_reg(block, inst, r)?;
                Ok((Operand::Reg(r), None))
            }
            Operand::Mem(mem) => {
                let (mem, target) = self.rewrite_mem(block, inst, mem)?;
                Ok((Operand::Mem(mem), target))
            }
        }
    }

    /// Rewrites a memory reference for emission. Known register components fold into the
    /// displacement, frame-relative bases are rebased onto the emitted stack pointer, and
    /// fully static addresses become RIP-relative (the absolute target is returned for
    /// the encoder to fix up).
    fn rewrite_mem(
        &mut self,
        block: CbbId,
        inst: &Instruction,
        mem: &MemRef,
    ) -> Result<(MemRef, Option<u64>)> {
        const RIP: MemRef = MemRef {
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            segment: None,
            rip_relative: true,
        };
        if mem.rip_relative {
            let abs = inst.end().wrapping_add(mem.disp as i64 as u64);
            return Ok((RIP, Some(abs)));
        }
        if mem.segment.is_some() {
            if let Some(base) = mem.base {
                self.prepare_read_reg(block, inst, base)?;
            }
            if let Some(index) = mem.index {
                self.prepare_read_reg(block, inst, index)?;
            }
            return Ok((*mem, None));
        }

        let mut disp = i64::from(mem.disp);
        let mut base: Option<Reg> = None;
        let mut frame_base = false;
        if let Some(b) = mem.base {
            match self.state.reg(b) {
                CaptureValue::Static(v) => disp = disp.wrapping_add(v as i64),
                CaptureValue::StackRel(offset) => {
                    frame_base = true;
                    disp = disp.wrapping_add(offset);
                }
                CaptureValue::Dynamic => base = Some(b),
            }
        }
        let mut index: Option<Reg> = None;
        if let Some(ix) = mem.index {
            match self.state.reg(ix) {
                CaptureValue::Static(v) => {
                    disp = disp.wrapping_add(v.wrapping_mul(u64::from(mem.scale)) as i64);
                }
                _ => {
                    self.prepare_read_reg(block, inst, ix)?;
                    index = Some(ix);
                }
            }
        }
        if frame_base {
            disp -= self.state.emitted_sp();
            base = Some(Reg::Rsp);
        }
        if base.is_none() && index.is_none() {
            return Ok((RIP, Some(disp as u64)));
        }
        match i32::try_from(disp) {
            Ok(d32) => Ok((
                MemRef {
                    base,
                    index,
                    scale: mem.scale,
                    disp: d32,
                    segment: None,
                    rip_relative: false,
                },
                None,
            )),
            Err(_) => {
                // A folded component pushed the displacement out of range; fall back to
                // the original registers made live.
                if let Some(b) = mem.base {
                    self.prepare_read_reg(block, inst, b)?;
                }
                if let Some(ix) = mem.index {
                    self.prepare_read_reg(block, inst, ix)?;
                }
                Ok((*mem, None))
            }
        }
    }

    /// Re-emits the contents of every folded stack slot a partial access touches, so the
    /// run-time slot bytes are valid before the access.
    fn materialize_covered(
        &mut self,
        block: CbbId,
        inst: &Instruction,
        offset: i64,
        width: Width,
    ) -> Result<()> {
        let first = offset & !7;
        let last = (offset + i64::from(width.bytes()) - 1) & !7;
        let mut slot = first;
        while slot <= last {
            match self.state.stack_slot(slot) {
                CaptureValue::Static(v) => {
                    if !value::fits_imm(v, Width::W64) {
                        return Err(Error::Unsupported {
                            address: inst.address,
                            text: format!(
                                "partial access to a folded stack slot holding {v:#x}"
                            ),
                        });
                    }
                    let disp = self.frame_disp(inst.address, slot)?;
                    self.emit(
                        block,
                        Instruction::binary(
                            inst.address,
                            Mnemonic::Mov,
                            Width::W64,
                            Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                            Operand::Imm(v as i64),
                        ),
                    )?;
                }
                CaptureValue::StackRel(_) => {
                    return Err(Error::Unsupported {
                        address: inst.address,
                        text: "partial access to a folded frame-address slot".into(),
                    });
                }
                CaptureValue::Dynamic => {}
            }
            slot += 8;
        }
        Ok(())
    }

    // ---- instruction handlers -----------------------------------------------------

    fn do_mov(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let (v, sample) = self.read_operand(inst, &inst.src, inst.width)?;
        match inst.dst {
            Operand::Reg(dst) => {
                if self.can_fold_reg_write(dst, inst.width, v) {
                    self.fold_write_reg(inst, dst, inst.width, v, sample.or(v.as_static()))?;
                    return Ok(Flow::Continue);
                }
                if matches!(inst.width, Width::W8 | Width::W16) {
                    // The untouched upper bits must be live for the merge.
                    self.prepare_read_reg(block, inst, dst)?;
                }
                let (src, target) =
                    self.rewrite_src(block, inst, &inst.src, inst.width, ImmPolicy::Any)?;
                let mut out = Instruction::binary(
                    inst.address,
                    Mnemonic::Mov,
                    inst.width,
                    Operand::Reg(dst),
                    src,
                );
                out.target = target;
                self.emit(block, out)?;
                self.emitted_write_reg(inst, dst, inst.width, sample)?;
                Ok(Flow::Continue)
            }
            Operand::Mem(mem) => {
                self.do_store(block, inst, &mem, v)?;
                Ok(Flow::Continue)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn do_store(
        &mut self,
        block: CbbId,
        inst: &Instruction,
        mem: &MemRef,
        v: CaptureValue,
    ) -> Result<()> {
        let addr = self.resolve_mem(mem, inst.end());
        match Self::classify(addr) {
            MemClass::Stack(offset) => {
                let full_slot = inst.width == Width::W64 && offset % 8 == 0;
                if full_slot && v.is_known() && !self.forced() {
                    self.state.stack_write_slot(offset, v);
                    return Ok(());
                }
                if !full_slot {
                    self.materialize_covered(block, inst, offset, inst.width)?;
                }
                let (src, _) =
                    self.rewrite_src(block, inst, &inst.src, inst.width, ImmPolicy::Fit)?;
                let disp = self.frame_disp(inst.address, offset)?;
                self.emit(
                    block,
                    Instruction::binary(
                        inst.address,
                        Mnemonic::Mov,
                        inst.width,
                        Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                        src,
                    ),
                )?;
                self.state.stack_clobber(offset, inst.width);
                Ok(())
            }
            MemClass::Global(_) | MemClass::Dynamic => {
                let (src, _) =
                    self.rewrite_src(block, inst, &inst.src, inst.width, ImmPolicy::Fit)?;
                let (out_mem, target) = self.rewrite_mem(block, inst, mem)?;
                let mut out = Instruction::binary(
                    inst.address,
                    Mnemonic::Mov,
                    inst.width,
                    Operand::Mem(out_mem),
                    src,
                );
                out.target = target;
                self.emit(block, out)
            }
        }
    }

    fn do_alu(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        // Zeroing idioms are static even over dynamic registers.
        let zeroing = matches!(inst.mnemonic, Mnemonic::Xor | Mnemonic::Sub)
            && inst.dst.as_reg().is_some()
            && inst.dst == inst.src;
        let three_op = !inst.src2.is_none();
        let (lhs, rhs) = if three_op {
            (&inst.src, &inst.src2)
        } else {
            (&inst.dst, &inst.src)
        };
        let (mut l, mut ls) = self.read_operand(inst, lhs, inst.width)?;
        let (mut r, mut rs) = self.read_operand(inst, rhs, inst.width)?;
        if zeroing {
            l = CaptureValue::Static(0);
            r = CaptureValue::Static(0);
            ls = Some(0);
            rs = Some(0);
        }
        let result = value::alu_abstract(inst.mnemonic, inst.width, l, r);
        let sample = ls
            .zip(rs)
            .and_then(|(a, b)| value::alu_static(inst.mnemonic, inst.width, a, b));
        let flags = FlagState {
            known: alu_producer(inst.mnemonic, inst.width, l.as_static(), r.as_static()),
            sampled: alu_producer(inst.mnemonic, inst.width, ls, rs),
        };
        match inst.dst {
            Operand::Reg(dst) => {
                if self.can_fold_reg_write(dst, inst.width, result) {
                    self.fold_write_reg(inst, dst, inst.width, result, sample)?;
                    self.state.set_flags(flags);
                    return Ok(Flow::Continue);
                }
                if !three_op {
                    // Two-operand forms read the destination.
                    self.prepare_read_reg(block, inst, dst)?;
                }
                let policy = if inst.mnemonic == Mnemonic::Imul {
                    ImmPolicy::Forbid
                } else {
                    ImmPolicy::Fit
                };
                let (src, target) =
                    self.rewrite_src(block, inst, &inst.src, inst.width, policy)?;
                let mut out = Instruction::binary(
                    inst.address,
                    inst.mnemonic,
                    inst.width,
                    Operand::Reg(dst),
                    src,
                );
                out.src2 = inst.src2;
                out.target = target;
                self.emit(block, out)?;
                self.emitted_write_reg(inst, dst, inst.width, sample)?;
                self.state.set_flags(FlagState {
                    known: FlagProducer::Unknown,
                    sampled: flags.sampled,
                });
                Ok(Flow::Continue)
            }
            Operand::Mem(mem) => {
                self.rmw_mem(block, inst, &mem, result, flags)?;
                Ok(Flow::Continue)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    /// Read-modify-write with a memory destination: folds entirely onto a tracked stack
    /// slot, or materializes the slot and captures the operation.
    fn rmw_mem(
        &mut self,
        block: CbbId,
        inst: &Instruction,
        mem: &MemRef,
        result: CaptureValue,
        flags: FlagState,
    ) -> Result<()> {
        let addr = self.resolve_mem(mem, inst.end());
        if let MemClass::Stack(offset) = Self::classify(addr) {
            let full_slot = inst.width == Width::W64 && offset % 8 == 0;
            if full_slot && result.is_known() && !self.forced() {
                self.state.stack_write_slot(offset, result);
                self.state.set_flags(flags);
                return Ok(());
            }
            // The operation reads the slot, so folded contents must be live first.
            self.materialize_covered(block, inst, offset, inst.width)?;
            let (src, _) = self.rewrite_src(block, inst, &inst.src, inst.width, ImmPolicy::Fit)?;
            let disp = self.frame_disp(inst.address, offset)?;
            let mut out = Instruction::binary(
                inst.address,
                inst.mnemonic,
                inst.width,
                Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                src,
            );
            out.cond = None;
            self.emit(block, out)?;
            self.state.stack_clobber(offset, inst.width);
            self.state.set_flags(FlagState {
                known: FlagProducer::Unknown,
                sampled: flags.sampled,
            });
            return Ok(());
        }
        let (src, _) = self.rewrite_src(block, inst, &inst.src, inst.width, ImmPolicy::Fit)?;
        let (out_mem, target) = self.rewrite_mem(block, inst, mem)?;
        let mut out = Instruction::binary(
            inst.address,
            inst.mnemonic,
            inst.width,
            Operand::Mem(out_mem),
            src,
        );
        out.target = target;
        self.emit(block, out)?;
        self.state.set_flags(FlagState {
            known: FlagProducer::Unknown,
            sampled: flags.sampled,
        });
        Ok(())
    }

    fn do_compare(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let (l, ls) = self.read_operand(inst, &inst.dst, inst.width)?;
        let (r, rs) = self.read_operand(inst, &inst.src, inst.width)?;
        let flags = FlagState {
            known: alu_producer(inst.mnemonic, inst.width, l.as_static(), r.as_static()),
            sampled: alu_producer(inst.mnemonic, inst.width, ls, rs),
        };
        if l.as_static().is_some() && r.as_static().is_some() {
            self.state.set_flags(flags);
            return Ok(Flow::Continue);
        }
        let (dst, t1) = self.rewrite_src(block, inst, &inst.dst, inst.width, ImmPolicy::Forbid)?;
        let (src, t2) = self.rewrite_src(block, inst, &inst.src, inst.width, ImmPolicy::Fit)?;
        let mut out = Instruction::binary(inst.address, inst.mnemonic, inst.width, dst, src);
        out.target = t1.or(t2);
        self.emit(block, out)?;
        self.state.set_flags(FlagState {
            known: FlagProducer::Unknown,
            sampled: flags.sampled,
        });
        Ok(Flow::Continue)
    }

    fn do_shift(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let (l, ls) = self.read_operand(inst, &inst.dst, inst.width)?;
        // The count is CL or imm8 regardless of operation width.
        let (r, rs) = self.read_operand(inst, &inst.src, Width::W8)?;
        let count_mask = if inst.width == Width::W64 { 63 } else { 31 };
        let result = value::alu_abstract(inst.mnemonic, inst.width, l, r);
        let sample = ls
            .zip(rs)
            .and_then(|(a, b)| value::alu_static(inst.mnemonic, inst.width, a, b));

        // A masked count of zero leaves the flags untouched.
        let previous = self.state.flags();
        let known = match r.as_static().map(|c| c & count_mask) {
            Some(0) => previous.known,
            Some(_) => result.as_static().map_or(FlagProducer::Unknown, |v| {
                FlagProducer::Result {
                    result: v,
                    width: inst.width,
                }
            }),
            None => FlagProducer::Unknown,
        };
        let sampled = match rs.map(|c| c & count_mask) {
            Some(0) => previous.sampled,
            Some(_) => sample.map_or(FlagProducer::Unknown, |v| FlagProducer::Result {
                result: v,
                width: inst.width,
            }),
            None => FlagProducer::Unknown,
        };
        let flags = FlagState { known, sampled };

        match inst.dst {
            Operand::Reg(dst) => {
                if self.can_fold_reg_write(dst, inst.width, result) {
                    self.fold_write_reg(inst, dst, inst.width, result, sample)?;
                    self.state.set_flags(flags);
                    return Ok(Flow::Continue);
                }
                self.prepare_read_reg(block, inst, dst)?;
                let (src, _) = self.rewrite_src(block, inst, &inst.src, Width::W8, ImmPolicy::Fit)?;
                self.emit(
                    block,
                    Instruction::binary(
                        inst.address,
                        inst.mnemonic,
                        inst.width,
                        Operand::Reg(dst),
                        src,
                    ),
                )?;
                self.emitted_write_reg(inst, dst, inst.width, sample)?;
                self.state.set_flags(FlagState {
                    known: FlagProducer::Unknown,
                    sampled: flags.sampled,
                });
                Ok(Flow::Continue)
            }
            Operand::Mem(mem) => {
                self.rmw_mem(block, inst, &mem, result, flags)?;
                Ok(Flow::Continue)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn do_unary(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let (v, s) = self.read_operand(inst, &inst.dst, inst.width)?;
        let result = match v {
            CaptureValue::Static(x) => value::alu_static_unary(inst.mnemonic, inst.width, x)
                .map_or(CaptureValue::Dynamic, CaptureValue::Static),
            _ => CaptureValue::Dynamic,
        };
        let sample = s.and_then(|x| value::alu_static_unary(inst.mnemonic, inst.width, x));
        let flags = if inst.mnemonic == Mnemonic::Not {
            // not is the one ALU operation that leaves the flags alone.
            self.state.flags()
        } else {
            FlagState {
                known: result.as_static().map_or(FlagProducer::Unknown, |v| {
                    FlagProducer::Result {
                        result: v,
                        width: inst.width,
                    }
                }),
                sampled: sample.map_or(FlagProducer::Unknown, |v| FlagProducer::Result {
                    result: v,
                    width: inst.width,
                }),
            }
        };
        match inst.dst {
            Operand::Reg(dst) => {
                if self.can_fold_reg_write(dst, inst.width, result) {
                    self.fold_write_reg(inst, dst, inst.width, result, sample)?;
                    self.state.set_flags(flags);
                    return Ok(Flow::Continue);
                }
                self.prepare_read_reg(block, inst, dst)?;
                self.emit(
                    block,
                    Instruction::unary(inst.address, inst.mnemonic, inst.width, Operand::Reg(dst)),
                )?;
                self.emitted_write_reg(inst, dst, inst.width, sample)?;
                self.state.set_flags(FlagState {
                    known: if inst.mnemonic == Mnemonic::Not {
                        flags.known
                    } else {
                        FlagProducer::Unknown
                    },
                    sampled: flags.sampled,
                });
                Ok(Flow::Continue)
            }
            Operand::Mem(mem) => {
                self.rmw_mem(block, inst, &mem, result, flags)?;
                Ok(Flow::Continue)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn do_extend(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let src_width = inst.src_width.unwrap_or(Width::W32);
        let (v, s) = self.read_operand(inst, &inst.src, src_width)?;
        let extend = |x: u64| -> u64 {
            let x = x & src_width.mask();
            let wide = if inst.mnemonic == Mnemonic::Movsx {
                value::sign_extend(x, src_width) as u64
            } else {
                x
            };
            wide & inst.width.mask()
        };
        let result = v
            .as_static()
            .map_or(CaptureValue::Dynamic, |x| CaptureValue::Static(extend(x)));
        let sample = s.map(extend);
        let dst = inst.dst.as_reg().ok_or_else(|| self.unsupported(inst))?;
        if self.can_fold_reg_write(dst, inst.width, result) {
            self.fold_write_reg(inst, dst, inst.width, result, sample)?;
            return Ok(Flow::Continue);
        }
        if inst.width == Width::W16 {
            self.prepare_read_reg(block, inst, dst)?;
        }
        let (src, target) = self.rewrite_src(block, inst, &inst.src, src_width, ImmPolicy::Forbid)?;
        let mut out = Instruction::binary(
            inst.address,
            inst.mnemonic,
            inst.width,
            Operand::Reg(dst),
            src,
        );
        out.src_width = Some(src_width);
        out.target = target;
        self.emit(block, out)?;
        self.emitted_write_reg(inst, dst, inst.width, sample)?;
        Ok(Flow::Continue)
    }

    fn do_lea(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let mem = inst.src.as_mem().ok_or_else(|| self.unsupported(inst))?;
        let dst = inst.dst.as_reg().ok_or_else(|| self.unsupported(inst))?;
        let addr = self.resolve_mem(mem, inst.end());
        if self.can_fold_reg_write(dst, inst.width, addr) {
            self.fold_write_reg(inst, dst, inst.width, addr, addr.as_static())?;
            return Ok(Flow::Continue);
        }
        let (out_mem, target) = self.rewrite_mem(block, inst, mem)?;
        let mut out = Instruction::binary(
            inst.address,
            Mnemonic::Lea,
            inst.width,
            Operand::Reg(dst),
            Operand::Mem(out_mem),
        );
        out.target = target;
        self.emit(block, out)?;
        self.emitted_write_reg(inst, dst, inst.width, addr.as_static())?;
        Ok(Flow::Continue)
    }

    fn do_xchg(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let (Some(a), Some(b)) = (inst.dst.as_reg(), inst.src.as_reg()) else {
            return Err(self.unsupported(inst));
        };
        let (va, sa) = (self.state.reg(a), self.state.sample(a));
        let (vb, sb) = (self.state.reg(b), self.state.sample(b));
        if inst.width == Width::W64 && va.is_known() && vb.is_known() && !self.forced() {
            self.fold_write_reg(inst, a, Width::W64, vb, sb)?;
            self.fold_write_reg(inst, b, Width::W64, va, sa)?;
            return Ok(Flow::Continue);
        }
        self.prepare_read_reg(block, inst, a)?;
        self.prepare_read_reg(block, inst, b)?;
        self.emit(
            block,
            Instruction::binary(
                inst.address,
                Mnemonic::Xchg,
                inst.width,
                Operand::Reg(a),
                Operand::Reg(b),
            ),
        )?;
        if inst.width == Width::W64 {
            // After the swap each run-time register holds the other's old (now live)
            // value, so knowledge survives the exchange.
            self.state.set_reg(a, vb);
            if vb.is_known() {
                self.state.mark_synced(a);
            }
            self.state.set_sample(a, sb);
            self.state.set_reg(b, va);
            if va.is_known() {
                self.state.mark_synced(b);
            }
            self.state.set_sample(b, sa);
        } else {
            self.emitted_write_reg(inst, a, inst.width, sb)?;
            self.emitted_write_reg(inst, b, inst.width, sa)?;
        }
        Ok(Flow::Continue)
    }

    fn do_push(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        if inst.width != Width::W64 {
            return Err(self.unsupported(inst));
        }
        let (v, _) = self.read_operand(inst, &inst.dst, Width::W64)?;
        let sp = self
            .state
            .sp_delta()
            .ok_or_else(|| self.assumption(inst, "push with a non-frame-relative stack pointer"))?;
        let new_sp = sp - 8;
        if v.is_known() && !self.forced() && new_sp % 8 == 0 {
            self.state.stack_write_slot(new_sp, v);
            self.set_rsp(new_sp);
            return Ok(Flow::Continue);
        }
        let (src, target) = self.rewrite_src(block, inst, &inst.dst, Width::W64, ImmPolicy::Fit)?;
        if self.state.emitted_sp() == sp {
            let mut out = Instruction::unary(inst.address, Mnemonic::Push, Width::W64, src);
            out.target = target;
            self.emit(block, out)?;
            self.state.set_emitted_sp(new_sp);
        } else {
            if matches!(src, Operand::Mem(_)) {
                return Err(self.unsupported(inst));
            }
            let disp = self.frame_disp(inst.address, new_sp)?;
            self.emit(
                block,
                Instruction::binary(
                    inst.address,
                    Mnemonic::Mov,
                    Width::W64,
                    Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                    src,
                ),
            )?;
        }
        self.state.stack_clobber(new_sp, Width::W64);
        self.set_rsp(new_sp);
        Ok(Flow::Continue)
    }

    fn do_pop(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let dst = inst.dst.as_reg().ok_or_else(|| self.unsupported(inst))?;
        if dst == Reg::Rsp {
            return Err(self.unsupported(inst));
        }
        let sp = self
            .state
            .sp_delta()
            .ok_or_else(|| self.assumption(inst, "pop with a non-frame-relative stack pointer"))?;
        let v = self.state.stack_read(sp, Width::W64);
        if v.is_known() && !self.forced() {
            self.fold_write_reg(inst, dst, Width::W64, v, v.as_static())?;
            self.set_rsp(sp + 8);
            return Ok(Flow::Continue);
        }
        if self.state.emitted_sp() == sp {
            self.emit(
                block,
                Instruction::unary(inst.address, Mnemonic::Pop, Width::W64, Operand::Reg(dst)),
            )?;
            self.state.set_emitted_sp(sp + 8);
        } else {
            let disp = self.frame_disp(inst.address, sp)?;
            self.emit(
                block,
                Instruction::binary(
                    inst.address,
                    Mnemonic::Mov,
                    Width::W64,
                    Operand::Reg(dst),
                    Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                ),
            )?;
        }
        self.emitted_write_reg(inst, dst, Width::W64, None)?;
        self.set_rsp(sp + 8);
        Ok(Flow::Continue)
    }

    fn do_leave(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let CaptureValue::StackRel(frame) = self.state.reg(Reg::Rbp) else {
            return Err(self.assumption(inst, "leave with a non-frame base pointer"));
        };
        self.set_rsp(frame);
        let v = self.state.stack_read(frame, Width::W64);
        if v.is_known() && !self.forced() {
            self.fold_write_reg(inst, Reg::Rbp, Width::W64, v, v.as_static())?;
        } else {
            if self.state.emitted_sp() == frame {
                self.emit(
                    block,
                    Instruction::unary(
                        inst.address,
                        Mnemonic::Pop,
                        Width::W64,
                        Operand::Reg(Reg::Rbp),
                    ),
                )?;
                self.state.set_emitted_sp(frame + 8);
            } else {
                let disp = self.frame_disp(inst.address, frame)?;
                self.emit(
                    block,
                    Instruction::binary(
                        inst.address,
                        Mnemonic::Mov,
                        Width::W64,
                        Operand::Reg(Reg::Rbp),
                        Operand::Mem(MemRef::base_disp(Reg::Rsp, disp)),
                    ),
                )?;
            }
            self.emitted_write_reg(inst, Reg::Rbp, Width::W64, None)?;
        }
        self.set_rsp(frame + 8);
        Ok(Flow::Continue)
    }

    fn do_convert(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let rax = self.state.reg(Reg::Rax);
        let sample = self.state.sample(Reg::Rax);
        match inst.mnemonic {
            Mnemonic::Cdqe => {
                let extend = |x: u64| value::sign_extend(x, Width::W32) as u64;
                if let CaptureValue::Static(x) = rax {
                    if !self.forced() {
                        self.fold_write_reg(
                            inst,
                            Reg::Rax,
                            Width::W64,
                            CaptureValue::Static(extend(x)),
                            sample.map(extend),
                        )?;
                        return Ok(Flow::Continue);
                    }
                }
                self.prepare_read_reg(block, inst, Reg::Rax)?;
                self.emit(
                    block,
                    Instruction::nullary(inst.address, Mnemonic::Cdqe, Width::W64),
                )?;
                self.emitted_write_reg(inst, Reg::Rax, Width::W64, sample.map(extend))?;
            }
            Mnemonic::Cdq | Mnemonic::Cqo => {
                let (fill_width, write_width) = if inst.mnemonic == Mnemonic::Cqo {
                    (Width::W64, Width::W64)
                } else {
                    (Width::W32, Width::W32)
                };
                let fill = move |x: u64| -> u64 {
                    if value::sign_extend(x, fill_width) < 0 {
                        fill_width.mask()
                    } else {
                        0
                    }
                };
                if let CaptureValue::Static(x) = rax {
                    if !self.forced() {
                        self.fold_write_reg(
                            inst,
                            Reg::Rdx,
                            write_width,
                            CaptureValue::Static(fill(x)),
                            sample.map(fill),
                        )?;
                        return Ok(Flow::Continue);
                    }
                }
                self.prepare_read_reg(block, inst, Reg::Rax)?;
                self.emit(
                    block,
                    Instruction::nullary(inst.address, inst.mnemonic, inst.width),
                )?;
                self.emitted_write_reg(inst, Reg::Rdx, write_width, sample.map(fill))?;
            }
            _ => return Err(self.unsupported(inst)),
        }
        Ok(Flow::Continue)
    }

    fn do_jmp(&mut self, inst: &Instruction) -> Result<Flow> {
        if let Some(target) = inst.target {
            return Ok(Flow::Goto(target));
        }
        let (v, _) = self.read_operand(inst, &inst.dst, Width::W64)?;
        match v {
            CaptureValue::Static(target) => Ok(Flow::Goto(target)),
            _ => Err(self.assumption(inst, "indirect jump target is not static")),
        }
    }

    fn do_jcc(&mut self, inst: &Instruction) -> Result<Flow> {
        let cond = inst.cond.ok_or_else(|| self.unsupported(inst))?;
        let taken = inst.target.ok_or_else(|| self.unsupported(inst))?;
        let flags = self.state.flags();
        if let Some(is_taken) = flags.known.eval(cond) {
            return Ok(Flow::Goto(if is_taken { taken } else { inst.end() }));
        }
        if self.config.assume_known_branches {
            if let Some(is_taken) = flags.sampled.eval(cond) {
                return Ok(Flow::Goto(if is_taken { taken } else { inst.end() }));
            }
            return Err(self.assumption(
                inst,
                "branch direction unknown even from the capture run's concrete values",
            ));
        }
        Ok(Flow::Branch {
            cond,
            taken,
            fall: inst.end(),
        })
    }

    fn do_call(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let target = match inst.target {
            Some(t) => CaptureValue::Static(t),
            None => self.read_operand(inst, &inst.dst, Width::W64)?.0,
        };
        let depth = self.state.call_depth();
        let depth_capped = self
            .config
            .force_unknown_depth
            .is_some_and(|limit| depth >= limit);
        if let CaptureValue::Static(t) = target {
            if self.config.is_function_addr(t) && !depth_capped {
                // Inline: the return address folds onto the tracked stack and emulation
                // continues inside the callee.
                let sp = self.state.sp_delta().ok_or_else(|| {
                    self.assumption(inst, "call with a non-frame-relative stack pointer")
                })?;
                let new_sp = sp - 8;
                self.state
                    .stack_write_slot(new_sp, CaptureValue::Static(inst.end()));
                self.set_rsp(new_sp);
                self.state.set_call_depth(depth + 1);
                return Ok(Flow::Goto(t));
            }
        }
        if matches!(target, CaptureValue::StackRel(_)) {
            return Err(self.assumption(inst, "call target points into the stack"));
        }
        // Opaque call: static argument registers become live, the real stack pointer
        // catches up, and everything caller-saved is forgotten afterwards.
        for reg in ARG_REGS {
            self.materialize(block, inst.address, reg)?;
        }
        self.sync_sp(block, inst.address)?;
        let out = match target {
            CaptureValue::Static(t) => {
                let mut call = Instruction::nullary(inst.address, Mnemonic::Call, Width::W64);
                call.target = Some(t);
                call
            }
            _ => {
                let (op, target_mem) =
                    self.rewrite_src(block, inst, &inst.dst, Width::W64, ImmPolicy::Forbid)?;
                let mut call =
                    Instruction::unary(inst.address, Mnemonic::Call, Width::W64, op);
                call.target = target_mem;
                call
            }
        };
        self.emit(block, out)?;
        for reg in CALLER_SAVED {
            self.state.set_reg(reg, CaptureValue::Dynamic);
            self.state.set_sample(reg, None);
        }
        self.state.set_flags(FlagState::unknown());
        Ok(Flow::Continue)
    }

    fn do_ret(&mut self, block: CbbId, inst: &Instruction) -> Result<Flow> {
        let depth = self.state.call_depth();
        let sp = self.state.sp_delta().ok_or_else(|| {
            self.assumption(inst, "return with a non-frame-relative stack pointer")
        })?;
        if depth > 0 {
            if !inst.dst.is_none() {
                return Err(self.unsupported(inst));
            }
            let CaptureValue::Static(ret) = self.state.stack_read(sp, Width::W64) else {
                return Err(
                    self.assumption(inst, "inlined return address was not statically tracked")
                );
            };
            self.set_rsp(sp + 8);
            self.state.set_call_depth(depth - 1);
            return Ok(Flow::Goto(ret));
        }
        // Outermost return: the architectural results become live, the real stack
        // pointer catches up, and the function ends.
        self.materialize(block, inst.address, Reg::Rax)?;
        self.materialize(block, inst.address, Reg::Rdx)?;
        self.sync_sp(block, inst.address)?;
        let mut out = Instruction::nullary(inst.address, Mnemonic::Ret, Width::W64);
        out.dst = inst.dst;
        self.emit(block, out)?;
        self.graph.set_exit_return(block);
        Ok(Flow::Done)
    }

    fn set_rsp(&mut self, delta: i64) {
        self.state.set_reg(Reg::Rsp, CaptureValue::StackRel(delta));
    }
}

fn add_known(v: CaptureValue, delta: i64) -> CaptureValue {
    match v {
        CaptureValue::Static(x) => CaptureValue::Static(x.wrapping_add(delta as u64)),
        CaptureValue::StackRel(d) => CaptureValue::StackRel(d.wrapping_add(delta)),
        CaptureValue::Dynamic => CaptureValue::Dynamic,
    }
}

/// Builds the flag producer for an ALU operation, given both operands when known.
fn alu_producer(
    mnemonic: Mnemonic,
    width: Width,
    l: Option<u64>,
    r: Option<u64>,
) -> FlagProducer {
    let Some((left, right)) = l.zip(r) else {
        return FlagProducer::Unknown;
    };
    match mnemonic {
        Mnemonic::Add => FlagProducer::Add { left, right, width },
        Mnemonic::Sub | Mnemonic::Cmp => FlagProducer::Cmp { left, right, width },
        Mnemonic::Test => FlagProducer::Test { left, right, width },
        Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
            match value::alu_static(mnemonic, width, left, right) {
                Some(result) => FlagProducer::Logic { result, width },
                None => FlagProducer::Unknown,
            }
        }
        // imul leaves ZF and SF undefined.
        _ => FlagProducer::Unknown,
    }
}

/// Reads constant data the caller declared readable.
fn read_global(addr: u64, width: Width) -> u64 {
    // SAFETY: the address lies in a range the caller declared as readable constant data,
    // which is part of the rewrite() contract.
    unsafe {
        match width {
            Width::W8 => u64::from(std::ptr::read_unaligned(addr as *const u8)),
            Width::W16 => u64::from(std::ptr::read_unaligned(addr as *const u16)),
            Width::W32 => u64::from(std::ptr::read_unaligned(addr as *const u32)),
            Width::W64 => std::ptr::read_unaligned(addr as *const u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::FlowType;
    use crate::capture::config::MemRange;

    fn run_capture(
        code: &[u8],
        config: &CaptureConfig,
        args: &[u64],
    ) -> Result<CaptureGraph> {
        let mut decoder = Decoder::new(512, 64);
        capture(&mut decoder, config, code.as_ptr() as u64, args, 512, 64)
    }

    fn mnemonics(graph: &CaptureGraph, block: CbbId) -> Vec<Mnemonic> {
        graph.block(block).instrs.iter().map(|c| c.inst.mnemonic).collect()
    }

    // mov rax, rdi; imul rax, rax; add rax, 5; ret
    const SQUARE_PLUS_5: [u8; 12] = [
        0x48, 0x89, 0xf8, 0x48, 0x0f, 0xaf, 0xc0, 0x48, 0x83, 0xc0, 0x05, 0xc3,
    ];

    #[test]
    fn dynamic_input_captures_everything() {
        let mut config = CaptureConfig::new();
        config.set_param_count(1).unwrap();
        let graph = run_capture(&SQUARE_PLUS_5, &config, &[7]).unwrap();
        assert_eq!(graph.blocks().len(), 1);
        let entry = graph.entry();
        assert_eq!(
            mnemonics(&graph, entry),
            vec![Mnemonic::Mov, Mnemonic::Imul, Mnemonic::Add, Mnemonic::Ret]
        );
        assert_eq!(graph.block(entry).exit, FlowType::Return);
    }

    #[test]
    fn static_input_folds_to_constant_return() {
        let config = CaptureConfig::new().with_static_param(0);
        let graph = run_capture(&SQUARE_PLUS_5, &config, &[5]).unwrap();
        let entry = graph.entry();
        // Everything folds; only the materialized result and the return remain.
        let instrs = &graph.block(entry).instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].inst.mnemonic, Mnemonic::Mov);
        assert_eq!(instrs[0].inst.dst.as_reg(), Some(Reg::Rax));
        assert_eq!(instrs[0].inst.src.as_imm(), Some(30));
        assert_eq!(instrs[1].inst.mnemonic, Mnemonic::Ret);
    }

    // cmp rdi, 0; jg +4; mov eax, 1; ret; mov eax, 2; ret
    const BRANCHY: [u8; 17] = [
        0x48, 0x83, 0xff, 0x00, // cmp rdi, 0
        0x7f, 0x06, // jg +6
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xc3, // ret
        0xb8, 0x02, 0x00, 0x00, 0x00, // mov eax, 2
    ];
    // Needs a trailing ret appended at runtime; build in a Vec instead.
    fn branchy_code() -> Vec<u8> {
        let mut code = BRANCHY.to_vec();
        code.push(0xc3);
        code
    }

    #[test]
    fn static_condition_folds_the_branch_away() {
        let code = branchy_code();
        let config = CaptureConfig::new().with_static_param(0);
        let graph = run_capture(&code, &config, &[5]).unwrap();
        // Positive input: only the taken side exists, with no compare or branch.
        assert_eq!(graph.blocks().len(), 1);
        let entry = graph.entry();
        let instrs = &graph.block(entry).instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].inst.src.as_imm(), Some(2));
        assert_eq!(graph.block(entry).exit, FlowType::Return);
    }

    #[test]
    fn dynamic_condition_captures_both_sides() {
        let code = branchy_code();
        let mut config = CaptureConfig::new();
        config.set_param_count(1).unwrap();
        let graph = run_capture(&code, &config, &[5]).unwrap();
        let entry_block = graph.block(graph.entry());
        assert_eq!(entry_block.exit, FlowType::CondJump);
        assert_eq!(entry_block.cond, Some(Cond::G));
        let taken = entry_block.taken.expect("taken side");
        let fall = entry_block.fallthrough.expect("fallthrough side");
        assert_ne!(taken, fall);
        assert_eq!(graph.block(taken).exit, FlowType::Return);
        assert_eq!(graph.block(fall).exit, FlowType::Return);
    }

    #[test]
    fn assume_known_branches_picks_the_sampled_side() {
        let code = branchy_code();
        let mut config = CaptureConfig::new();
        config.set_param_count(1).unwrap();
        config.assume_known_branches = true;
        let graph = run_capture(&code, &config, &[5]).unwrap();
        // The compare is captured, but the branch resolves along the sampled path.
        assert_eq!(graph.blocks().len(), 1);
        let entry = graph.entry();
        let ms = mnemonics(&graph, entry);
        assert!(ms.contains(&Mnemonic::Cmp));
        assert!(!ms.contains(&Mnemonic::Jcc));
        let instrs = &graph.block(entry).instrs;
        let mov = instrs.iter().find(|c| c.inst.mnemonic == Mnemonic::Mov).unwrap();
        assert_eq!(mov.inst.src.as_imm(), Some(2));
    }

    // L: dec rdi; jnz L; mov rax, rdi; ret
    const COUNTDOWN: [u8; 9] = [
        0x48, 0xff, 0xcf, // dec rdi
        0x75, 0xfb, // jnz -5
        0x48, 0x89, 0xf8, // mov rax, rdi
        0xc3, // ret
    ];

    #[test]
    fn dynamic_loop_closes_on_equal_state() {
        let mut config = CaptureConfig::new();
        config.set_param_count(1).unwrap();
        let graph = run_capture(&COUNTDOWN, &config, &[3]).unwrap();
        let entry = graph.entry();
        let entry_block = graph.block(entry);
        assert_eq!(entry_block.exit, FlowType::CondJump);
        // The back edge re-enters the loop head in an identical state: a self loop.
        assert_eq!(entry_block.taken, Some(entry));
        let fall = entry_block.fallthrough.expect("exit path");
        assert_eq!(graph.block(fall).exit, FlowType::Return);
    }

    #[test]
    fn static_loop_unrolls_completely() {
        let config = CaptureConfig::new().with_static_param(0);
        let graph = run_capture(&COUNTDOWN, &config, &[3]).unwrap();
        // Three folded iterations, then a constant result.
        assert_eq!(graph.blocks().len(), 1);
        let instrs = &graph.block(graph.entry()).instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].inst.src.as_imm(), Some(0));
        assert_eq!(instrs[0].inst.dst.as_reg(), Some(Reg::Rax));
    }

    // push rbx; mov rbx, rdi; add rbx, rsi; mov rax, rbx; pop rbx; ret
    const PUSH_POP: [u8; 12] = [
        0x53, // push rbx
        0x48, 0x89, 0xfb, // mov rbx, rdi
        0x48, 0x01, 0xf3, // add rbx, rsi
        0x48, 0x89, 0xd8, // mov rax, rbx
        0x5b, // pop rbx
        0xc3, // ret
    ];

    #[test]
    fn dynamic_push_pop_stays_balanced() {
        let mut config = CaptureConfig::new();
        config.set_param_count(2).unwrap();
        let graph = run_capture(&PUSH_POP, &config, &[1, 2]).unwrap();
        let instrs = &graph.block(graph.entry()).instrs;
        let ms: Vec<Mnemonic> = instrs.iter().map(|c| c.inst.mnemonic).collect();
        assert_eq!(
            ms,
            vec![
                Mnemonic::Push,
                Mnemonic::Mov,
                Mnemonic::Add,
                Mnemonic::Mov,
                Mnemonic::Pop,
                Mnemonic::Ret
            ]
        );
    }

    #[test]
    fn const_data_loads_fold() {
        let table: [u64; 2] = [111, 222];
        // mov rax, [rdi]; ret
        let code = [0x48, 0x8b, 0x07, 0xc3];
        let config = CaptureConfig::new()
            .with_static_param(0)
            .with_range(MemRange {
                name: "table".into(),
                start: table.as_ptr() as u64,
                len: 16,
                kind: RangeKind::ConstData,
            });
        let graph = run_capture(&code, &config, &[table.as_ptr() as u64 + 8]).unwrap();
        let instrs = &graph.block(graph.entry()).instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].inst.src.as_imm(), Some(222));
    }

    #[test]
    fn capture_capacity_overflow_is_reported() {
        let mut config = CaptureConfig::new();
        config.set_param_count(1).unwrap();
        let mut decoder = Decoder::new(512, 64);
        let err = capture(
            &mut decoder,
            &config,
            SQUARE_PLUS_5.as_ptr() as u64,
            &[7],
            2,
            64,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CaptureOverflow { .. }));
    }

    #[test]
    fn zeroing_idiom_is_static() {
        // xor eax, eax; ret
        let code = [0x31, 0xc0, 0xc3];
        let config = CaptureConfig::new();
        let graph = run_capture(&code, &config, &[]).unwrap();
        let instrs = &graph.block(graph.entry()).instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].inst.mnemonic, Mnemonic::Mov);
        assert_eq!(instrs[0].inst.src.as_imm(), Some(0));
    }
}

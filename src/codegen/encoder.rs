//! x86-64 machine-code emission for captured block graphs.
//!
//! # Overview
//!
//! Encoding runs in two passes over a [`CaptureGraph`]. The first pass lays blocks out
//! depth-first with fall-through preference, rendering every captured instruction into
//! bytes at its final address (the storage base is known up front, so RIP-relative data
//! references resolve immediately). Branch terminators are derived from each block's exit
//! metadata and emitted with placeholder displacements. The second pass patches those
//! rel32 fields once every target block has a concrete offset.
//!
//! Calls back into the original program may land outside rel32 range of the generated
//! code; those bounce through `r11`, which is caller-saved and therefore dead at a call
//! boundary.

use crate::asm::{FlowType, Instruction, MemRef, Mnemonic, Operand, Reg, Segment, Width};
use crate::capture::{CaptureGraph, CbbId};
use crate::{Error, Result};

/// The register-or-memory half of a ModRM pair.
#[derive(Clone, Copy)]
enum Rm<'a> {
    Reg(Reg),
    Mem(&'a MemRef),
}

fn rm_of<'a>(inst: &Instruction, op: &'a Operand) -> Result<Rm<'a>> {
    match op {
        Operand::Reg(r) => Ok(Rm::Reg(*r)),
        Operand::Mem(m) => Ok(Rm::Mem(m)),
        _ => Err(unencodable(inst)),
    }
}

fn unencodable(inst: &Instruction) -> Error {
    Error::Encode(format!("no encoding for '{inst}' at {:#x}", inst.address))
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | (reg << 3) | rm
}

/// Selects the 8-bit or wider opcode of a width-paired form.
fn wsel(width: Width, byte_op: u8, wide_op: u8) -> u8 {
    if width == Width::W8 {
        byte_op
    } else {
        wide_op
    }
}

/// True when an 8-bit access to one of these registers needs an empty REX prefix to
/// select `spl`/`bpl`/`sil`/`dil` instead of the legacy high-byte registers.
fn byte_rex(width: Width, regs: &[Reg]) -> bool {
    width == Width::W8 && regs.iter().any(|r| (4..8).contains(&r.index()))
}

/// Base opcode and ModRM digit of the classic ALU group.
fn alu_encoding(mnemonic: Mnemonic) -> (u8, u8) {
    match mnemonic {
        Mnemonic::Add => (0x00, 0),
        Mnemonic::Or => (0x08, 1),
        Mnemonic::And => (0x20, 4),
        Mnemonic::Sub => (0x28, 5),
        Mnemonic::Xor => (0x30, 6),
        _ => (0x38, 7), // cmp
    }
}

/// ModRM mode bits for a displacement: 0 (no disp), 1 (disp8) or 2 (disp32).
/// A base whose low three bits are 5 (rbp/r13) has no disp-free form and gets a
/// zero disp8 instead.
fn disp_mode(disp: i32, base3: u8) -> u8 {
    if disp == 0 && base3 != 5 {
        0
    } else if i8::try_from(disp).is_ok() {
        1
    } else {
        2
    }
}

fn scale_bits(scale: u8) -> Result<u8> {
    match scale {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        _ => Err(Error::Encode(format!("invalid index scale {scale}"))),
    }
}

/// Renders instructions into bytes at a fixed load address.
struct Assembler {
    base: u64,
    buf: Vec<u8>,
    /// Position and absolute target of a RIP-relative disp32 awaiting the end of the
    /// current instruction (trailing immediates shift the anchor).
    pending_rip: Option<(usize, u64)>,
}

impl Assembler {
    fn new(base: u64) -> Assembler {
        Assembler {
            base,
            buf: Vec::new(),
            pending_rip: None,
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn addr(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_imm(&mut self, width: Width, v: i64) {
        match width {
            Width::W8 => self.buf.push(v as u8),
            Width::W16 => self.put_u16(v as u16),
            // 64-bit forms take a sign-extended imm32.
            Width::W32 | Width::W64 => self.put_u32(v as u32),
        }
    }

    /// Emits prefixes, opcode and ModRM/SIB for one operation.
    fn put_op(
        &mut self,
        width: Width,
        opcode: &[u8],
        reg: u8,
        rm: Rm<'_>,
        target: Option<u64>,
        force_rex: bool,
    ) -> Result<()> {
        if let Rm::Mem(mem) = rm {
            match mem.segment {
                Some(Segment::Fs) => self.buf.push(0x64),
                Some(Segment::Gs) => self.buf.push(0x65),
                None => {}
            }
        }
        if width == Width::W16 {
            self.buf.push(0x66);
        }
        let mut rex = 0u8;
        if width == Width::W64 {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        match rm {
            Rm::Reg(r) => {
                if r.index() >= 8 {
                    rex |= 0x01;
                }
            }
            Rm::Mem(mem) => {
                if mem.index.is_some_and(|ix| ix.index() >= 8) {
                    rex |= 0x02;
                }
                if mem.base.is_some_and(|b| b.index() >= 8) {
                    rex |= 0x01;
                }
            }
        }
        if rex != 0 || force_rex {
            self.buf.push(0x40 | rex);
        }
        self.buf.extend_from_slice(opcode);
        match rm {
            Rm::Reg(r) => {
                self.buf.push(modrm(3, reg & 7, r.index() & 7));
                Ok(())
            }
            Rm::Mem(mem) => self.put_mem(reg & 7, mem, target),
        }
    }

    fn put_mem(&mut self, reg3: u8, mem: &MemRef, target: Option<u64>) -> Result<()> {
        if mem.rip_relative {
            let target = target.ok_or_else(|| {
                Error::Encode("rip-relative operand without a resolved target".into())
            })?;
            self.buf.push(modrm(0, reg3, 5));
            self.pending_rip = Some((self.buf.len(), target));
            self.put_u32(0);
            return Ok(());
        }
        match (mem.base, mem.index) {
            (Some(base), None) if base.index() & 7 != 4 => {
                let b3 = base.index() & 7;
                let mode = disp_mode(mem.disp, b3);
                self.buf.push(modrm(mode, reg3, b3));
                self.put_disp(mode, mem.disp);
            }
            (Some(base), index) => {
                // SIB form: an index register, or rsp/r12 as base.
                let b3 = base.index() & 7;
                let (i3, ss) = match index {
                    Some(ix) if ix == Reg::Rsp => {
                        return Err(Error::Encode("rsp cannot be an index register".into()));
                    }
                    Some(ix) => (ix.index() & 7, scale_bits(mem.scale)?),
                    None => (4, 0),
                };
                let mode = disp_mode(mem.disp, b3);
                self.buf.push(modrm(mode, reg3, 4));
                self.buf.push(modrm(ss, i3, b3));
                self.put_disp(mode, mem.disp);
            }
            (None, Some(ix)) => {
                if ix == Reg::Rsp {
                    return Err(Error::Encode("rsp cannot be an index register".into()));
                }
                self.buf.push(modrm(0, reg3, 4));
                self.buf.push(modrm(scale_bits(mem.scale)?, ix.index() & 7, 5));
                self.put_u32(mem.disp as u32);
            }
            (None, None) => {
                // Absolute 32-bit address.
                self.buf.push(modrm(0, reg3, 4));
                self.buf.push(modrm(0, 4, 5));
                self.put_u32(mem.disp as u32);
            }
        }
        Ok(())
    }

    fn put_disp(&mut self, mode: u8, disp: i32) {
        match mode {
            0 => {}
            1 => self.buf.push(disp as u8),
            _ => self.put_u32(disp as u32),
        }
    }

    fn mov_reg_imm(&mut self, width: Width, dst: Reg, v: i64) -> Result<()> {
        match width {
            Width::W64 => {
                if i32::try_from(v).is_ok() {
                    self.put_op(Width::W64, &[0xc7], 0, Rm::Reg(dst), None, false)?;
                    self.put_u32(v as u32);
                } else {
                    let mut rex = 0x48;
                    if dst.index() >= 8 {
                        rex |= 0x01;
                    }
                    self.buf.push(rex);
                    self.buf.push(0xb8 + (dst.index() & 7));
                    self.put_u64(v as u64);
                }
            }
            Width::W32 => {
                if dst.index() >= 8 {
                    self.buf.push(0x41);
                }
                self.buf.push(0xb8 + (dst.index() & 7));
                self.put_u32(v as u32);
            }
            Width::W16 => {
                self.buf.push(0x66);
                if dst.index() >= 8 {
                    self.buf.push(0x41);
                }
                self.buf.push(0xb8 + (dst.index() & 7));
                self.put_u16(v as u16);
            }
            Width::W8 => {
                if dst.index() >= 8 {
                    self.buf.push(0x41);
                } else if byte_rex(Width::W8, &[dst]) {
                    self.buf.push(0x40);
                }
                self.buf.push(0xb0 + (dst.index() & 7));
                self.buf.push(v as u8);
            }
        }
        Ok(())
    }

    /// Encodes one captured instruction at the current position.
    fn encode(&mut self, inst: &Instruction) -> Result<()> {
        self.pending_rip = None;
        self.encode_body(inst)?;
        if let Some((pos, target)) = self.pending_rip.take() {
            let delta = target.wrapping_sub(self.addr()) as i64;
            let rel = i32::try_from(delta).map_err(|_| {
                Error::Encode(format!(
                    "rip-relative target {target:#x} out of range at {:#x}",
                    self.addr()
                ))
            })?;
            self.buf[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    fn encode_body(&mut self, inst: &Instruction) -> Result<()> {
        let width = inst.width;
        match inst.mnemonic {
            Mnemonic::Nop => {
                self.buf.push(0x90);
                Ok(())
            }
            Mnemonic::Mov => match (&inst.dst, &inst.src) {
                (Operand::Reg(d), Operand::Imm(v)) => self.mov_reg_imm(width, *d, *v),
                (Operand::Reg(d), Operand::Reg(s)) => self.put_op(
                    width,
                    &[wsel(width, 0x88, 0x89)],
                    s.index(),
                    Rm::Reg(*d),
                    None,
                    byte_rex(width, &[*d, *s]),
                ),
                (Operand::Reg(d), Operand::Mem(m)) => self.put_op(
                    width,
                    &[wsel(width, 0x8a, 0x8b)],
                    d.index(),
                    Rm::Mem(m),
                    inst.target,
                    byte_rex(width, &[*d]),
                ),
                (Operand::Mem(m), Operand::Reg(s)) => self.put_op(
                    width,
                    &[wsel(width, 0x88, 0x89)],
                    s.index(),
                    Rm::Mem(m),
                    inst.target,
                    byte_rex(width, &[*s]),
                ),
                (Operand::Mem(m), Operand::Imm(v)) => {
                    self.put_op(
                        width,
                        &[wsel(width, 0xc6, 0xc7)],
                        0,
                        Rm::Mem(m),
                        inst.target,
                        false,
                    )?;
                    self.put_imm(width, *v);
                    Ok(())
                }
                _ => Err(unencodable(inst)),
            },
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Cmp => {
                let (base, digit) = alu_encoding(inst.mnemonic);
                match (&inst.dst, &inst.src) {
                    (Operand::Reg(d), Operand::Reg(s)) => self.put_op(
                        width,
                        &[wsel(width, base, base + 1)],
                        s.index(),
                        Rm::Reg(*d),
                        None,
                        byte_rex(width, &[*d, *s]),
                    ),
                    (Operand::Reg(d), Operand::Mem(m)) => self.put_op(
                        width,
                        &[wsel(width, base + 2, base + 3)],
                        d.index(),
                        Rm::Mem(m),
                        inst.target,
                        byte_rex(width, &[*d]),
                    ),
                    (Operand::Mem(m), Operand::Reg(s)) => self.put_op(
                        width,
                        &[wsel(width, base, base + 1)],
                        s.index(),
                        Rm::Mem(m),
                        inst.target,
                        byte_rex(width, &[*s]),
                    ),
                    (dst, Operand::Imm(v)) => {
                        let rm = rm_of(inst, dst)?;
                        let force = match dst {
                            Operand::Reg(r) => byte_rex(width, &[*r]),
                            _ => false,
                        };
                        if width == Width::W8 {
                            self.put_op(width, &[0x80], digit, rm, inst.target, force)?;
                            self.buf.push(*v as u8);
                        } else if i8::try_from(*v).is_ok() {
                            self.put_op(width, &[0x83], digit, rm, inst.target, force)?;
                            self.buf.push(*v as u8);
                        } else {
                            self.put_op(width, &[0x81], digit, rm, inst.target, force)?;
                            self.put_imm(width, *v);
                        }
                        Ok(())
                    }
                    _ => Err(unencodable(inst)),
                }
            }
            Mnemonic::Test => match (&inst.dst, &inst.src) {
                (Operand::Reg(d), Operand::Mem(m)) => self.put_op(
                    width,
                    &[wsel(width, 0x84, 0x85)],
                    d.index(),
                    Rm::Mem(m),
                    inst.target,
                    byte_rex(width, &[*d]),
                ),
                (dst, Operand::Reg(s)) => {
                    let force = match dst {
                        Operand::Reg(r) => byte_rex(width, &[*r, *s]),
                        _ => byte_rex(width, &[*s]),
                    };
                    self.put_op(
                        width,
                        &[wsel(width, 0x84, 0x85)],
                        s.index(),
                        rm_of(inst, dst)?,
                        inst.target,
                        force,
                    )
                }
                (dst, Operand::Imm(v)) => {
                    let force = match dst {
                        Operand::Reg(r) => byte_rex(width, &[*r]),
                        _ => false,
                    };
                    self.put_op(
                        width,
                        &[wsel(width, 0xf6, 0xf7)],
                        0,
                        rm_of(inst, dst)?,
                        inst.target,
                        force,
                    )?;
                    self.put_imm(width, *v);
                    Ok(())
                }
                _ => Err(unencodable(inst)),
            },
            Mnemonic::Imul => {
                let d = inst.dst.as_reg().ok_or_else(|| unencodable(inst))?;
                match inst.src2 {
                    Operand::None => self.put_op(
                        width,
                        &[0x0f, 0xaf],
                        d.index(),
                        rm_of(inst, &inst.src)?,
                        inst.target,
                        false,
                    ),
                    Operand::Imm(v) => {
                        if i8::try_from(v).is_ok() {
                            self.put_op(
                                width,
                                &[0x6b],
                                d.index(),
                                rm_of(inst, &inst.src)?,
                                inst.target,
                                false,
                            )?;
                            self.buf.push(v as u8);
                        } else {
                            self.put_op(
                                width,
                                &[0x69],
                                d.index(),
                                rm_of(inst, &inst.src)?,
                                inst.target,
                                false,
                            )?;
                            self.put_imm(width, v);
                        }
                        Ok(())
                    }
                    _ => Err(unencodable(inst)),
                }
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let digit = match inst.mnemonic {
                    Mnemonic::Shl => 4,
                    Mnemonic::Shr => 5,
                    _ => 7, // sar
                };
                let force = match inst.dst {
                    Operand::Reg(r) => byte_rex(width, &[r]),
                    _ => false,
                };
                match inst.src {
                    Operand::Imm(v) => {
                        self.put_op(
                            width,
                            &[wsel(width, 0xc0, 0xc1)],
                            digit,
                            rm_of(inst, &inst.dst)?,
                            inst.target,
                            force,
                        )?;
                        self.buf.push(v as u8);
                        Ok(())
                    }
                    Operand::Reg(Reg::Rcx) => self.put_op(
                        width,
                        &[wsel(width, 0xd2, 0xd3)],
                        digit,
                        rm_of(inst, &inst.dst)?,
                        inst.target,
                        force,
                    ),
                    _ => Err(unencodable(inst)),
                }
            }
            Mnemonic::Neg | Mnemonic::Not | Mnemonic::Inc | Mnemonic::Dec => {
                let (base, digit) = match inst.mnemonic {
                    Mnemonic::Neg => (0xf6, 3),
                    Mnemonic::Not => (0xf6, 2),
                    Mnemonic::Inc => (0xfe, 0),
                    _ => (0xfe, 1), // dec
                };
                let force = match inst.dst {
                    Operand::Reg(r) => byte_rex(width, &[r]),
                    _ => false,
                };
                self.put_op(
                    width,
                    &[wsel(width, base, base + 1)],
                    digit,
                    rm_of(inst, &inst.dst)?,
                    inst.target,
                    force,
                )
            }
            Mnemonic::Movzx | Mnemonic::Movsx => {
                let d = inst.dst.as_reg().ok_or_else(|| unencodable(inst))?;
                let sw = inst.src_width.ok_or_else(|| unencodable(inst))?;
                let opcode: &[u8] = match (inst.mnemonic, sw) {
                    (Mnemonic::Movzx, Width::W8) => &[0x0f, 0xb6],
                    (Mnemonic::Movzx, Width::W16) => &[0x0f, 0xb7],
                    (Mnemonic::Movsx, Width::W8) => &[0x0f, 0xbe],
                    (Mnemonic::Movsx, Width::W16) => &[0x0f, 0xbf],
                    (Mnemonic::Movsx, Width::W32) => &[0x63],
                    _ => return Err(unencodable(inst)),
                };
                // The byte-register REX rule applies to the narrow source.
                let force = match inst.src {
                    Operand::Reg(r) => byte_rex(sw, &[r]),
                    _ => false,
                };
                self.put_op(
                    width,
                    opcode,
                    d.index(),
                    rm_of(inst, &inst.src)?,
                    inst.target,
                    force,
                )
            }
            Mnemonic::Lea => {
                let d = inst.dst.as_reg().ok_or_else(|| unencodable(inst))?;
                let m = inst.src.as_mem().ok_or_else(|| unencodable(inst))?;
                self.put_op(width, &[0x8d], d.index(), Rm::Mem(m), inst.target, false)
            }
            Mnemonic::Xchg => {
                let d = inst.dst.as_reg().ok_or_else(|| unencodable(inst))?;
                let s = inst.src.as_reg().ok_or_else(|| unencodable(inst))?;
                self.put_op(
                    width,
                    &[wsel(width, 0x86, 0x87)],
                    s.index(),
                    Rm::Reg(d),
                    None,
                    byte_rex(width, &[d, s]),
                )
            }
            Mnemonic::Push => match &inst.dst {
                Operand::Reg(r) => {
                    if r.index() >= 8 {
                        self.buf.push(0x41);
                    }
                    self.buf.push(0x50 + (r.index() & 7));
                    Ok(())
                }
                Operand::Imm(v) => {
                    if i8::try_from(*v).is_ok() {
                        self.buf.push(0x6a);
                        self.buf.push(*v as u8);
                    } else {
                        self.buf.push(0x68);
                        self.put_u32(*v as u32);
                    }
                    Ok(())
                }
                Operand::Mem(m) => {
                    // Stack operations default to 64-bit; no REX.W.
                    self.put_op(Width::W32, &[0xff], 6, Rm::Mem(m), inst.target, false)
                }
                Operand::None => Err(unencodable(inst)),
            },
            Mnemonic::Pop => {
                let r = inst.dst.as_reg().ok_or_else(|| unencodable(inst))?;
                if r.index() >= 8 {
                    self.buf.push(0x41);
                }
                self.buf.push(0x58 + (r.index() & 7));
                Ok(())
            }
            Mnemonic::Call => match (inst.target, &inst.dst) {
                (Some(target), Operand::None) => {
                    let delta = target.wrapping_sub(self.addr() + 5) as i64;
                    match i32::try_from(delta) {
                        Ok(rel) => {
                            self.buf.push(0xe8);
                            self.put_u32(rel as u32);
                        }
                        Err(_) => {
                            // Out of rel32 range: bounce through r11.
                            self.buf.push(0x49);
                            self.buf.push(0xbb);
                            self.put_u64(target);
                            self.buf.extend_from_slice(&[0x41, 0xff, 0xd3]);
                        }
                    }
                    Ok(())
                }
                (_, op) => self.put_op(
                    Width::W32,
                    &[0xff],
                    2,
                    rm_of(inst, op)?,
                    inst.target,
                    false,
                ),
            },
            Mnemonic::Ret => {
                if let Operand::Imm(v) = inst.dst {
                    self.buf.push(0xc2);
                    self.put_u16(v as u16);
                } else {
                    self.buf.push(0xc3);
                }
                Ok(())
            }
            Mnemonic::Cdq => {
                self.buf.push(0x99);
                Ok(())
            }
            Mnemonic::Cqo => {
                self.buf.extend_from_slice(&[0x48, 0x99]);
                Ok(())
            }
            Mnemonic::Cdqe => {
                self.buf.extend_from_slice(&[0x48, 0x98]);
                Ok(())
            }
            Mnemonic::Leave => {
                self.buf.push(0xc9);
                Ok(())
            }
            // Branch terminators are derived from block exits, never stored in bodies.
            Mnemonic::Jmp | Mnemonic::Jcc => Err(unencodable(inst)),
        }
    }

    /// Emits `jcc rel32` with a zero displacement, returning the patch position.
    fn put_jcc_placeholder(&mut self, cond: crate::asm::Cond) -> usize {
        self.buf.push(0x0f);
        self.buf.push(0x80 + cond.code());
        let pos = self.buf.len();
        self.put_u32(0);
        pos
    }

    /// Emits `jmp rel32` with a zero displacement, returning the patch position.
    fn put_jmp_placeholder(&mut self) -> usize {
        self.buf.push(0xe9);
        let pos = self.buf.len();
        self.put_u32(0);
        pos
    }
}

/// Encodes a captured graph into executable bytes for the given load address.
pub(crate) fn encode_graph(graph: &CaptureGraph, base: u64) -> Result<Vec<u8>> {
    let mut asm = Assembler::new(base);
    let count = graph.blocks().len();
    let mut offsets: Vec<Option<usize>> = vec![None; count];
    let mut fixups: Vec<(usize, CbbId)> = Vec::new();
    let mut work: Vec<CbbId> = vec![graph.entry()];

    while let Some(start) = work.pop() {
        if offsets[start.0 as usize].is_some() {
            continue;
        }
        let mut current = start;
        loop {
            offsets[current.0 as usize] = Some(asm.len());
            let block = graph.block(current);
            for captured in &block.instrs {
                asm.encode(&captured.inst)?;
            }
            match block.exit {
                FlowType::Return => break,
                FlowType::Jump => {
                    let taken = block
                        .taken
                        .ok_or_else(|| Error::Encode("jump block without a target".into()))?;
                    if offsets[taken.0 as usize].is_none() {
                        current = taken;
                        continue;
                    }
                    fixups.push((asm.put_jmp_placeholder(), taken));
                    break;
                }
                FlowType::CondJump => {
                    let cond = block
                        .cond
                        .ok_or_else(|| Error::Encode("branch block without a condition".into()))?;
                    let taken = block
                        .taken
                        .ok_or_else(|| Error::Encode("branch block without a taken edge".into()))?;
                    let fall = block.fallthrough.ok_or_else(|| {
                        Error::Encode("branch block without a fall-through edge".into())
                    })?;
                    if offsets[fall.0 as usize].is_none() {
                        fixups.push((asm.put_jcc_placeholder(cond), taken));
                        work.push(taken);
                        current = fall;
                        continue;
                    }
                    if offsets[taken.0 as usize].is_none() {
                        // Fall-through already placed: invert and chain the taken side.
                        fixups.push((asm.put_jcc_placeholder(cond.negate()), fall));
                        current = taken;
                        continue;
                    }
                    fixups.push((asm.put_jcc_placeholder(cond), taken));
                    fixups.push((asm.put_jmp_placeholder(), fall));
                    break;
                }
                _ => {
                    return Err(Error::Encode(format!(
                        "block captured from {:#x} was never terminated",
                        block.entry
                    )));
                }
            }
        }
    }

    let mut code = asm.finish();
    for (pos, target) in fixups {
        let offset = offsets[target.0 as usize]
            .ok_or_else(|| Error::Encode("branch to an unplaced block".into()))?;
        let rel = i32::try_from(offset as i64 - (pos as i64 + 4))
            .map_err(|_| Error::Encode("branch displacement out of range".into()))?;
        code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Cond;
    use crate::capture::{CaptureGraph, CapturedInst};

    fn assemble(insts: &[Instruction]) -> Vec<u8> {
        let mut asm = Assembler::new(0x1000);
        for inst in insts {
            asm.encode(inst).unwrap();
        }
        asm.finish()
    }

    fn mov_ri(reg: Reg, v: i64) -> Instruction {
        Instruction::mov_reg_imm(0, reg, v)
    }

    #[test]
    fn mov_imm_forms() {
        assert_eq!(
            assemble(&[mov_ri(Reg::Rax, 5)]),
            vec![0x48, 0xc7, 0xc0, 0x05, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            assemble(&[mov_ri(Reg::R10, 0x1_2345_6789)]),
            vec![0x49, 0xba, 0x89, 0x67, 0x45, 0x23, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn alu_imm_shortens_to_imm8() {
        let add = Instruction::binary(
            0,
            Mnemonic::Add,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Imm(1),
        );
        assert_eq!(assemble(&[add]), vec![0x48, 0x83, 0xc0, 0x01]);
        let sub = Instruction::binary(
            0,
            Mnemonic::Sub,
            Width::W64,
            Operand::Reg(Reg::Rsp),
            Operand::Imm(0x1000),
        );
        assert_eq!(
            assemble(&[sub]),
            vec![0x48, 0x81, 0xec, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn rsp_relative_memory_uses_sib() {
        let cmp = Instruction::binary(
            0,
            Mnemonic::Cmp,
            Width::W64,
            Operand::Mem(MemRef::base_disp(Reg::Rsp, 8)),
            Operand::Reg(Reg::Rsi),
        );
        assert_eq!(assemble(&[cmp]), vec![0x48, 0x39, 0x74, 0x24, 0x08]);
        let lea = Instruction::binary(
            0,
            Mnemonic::Lea,
            Width::W64,
            Operand::Reg(Reg::Rdi),
            Operand::Mem(MemRef::base_disp(Reg::Rsp, 16)),
        );
        assert_eq!(assemble(&[lea]), vec![0x48, 0x8d, 0x7c, 0x24, 0x10]);
    }

    #[test]
    fn rbp_and_r13_bases_get_a_zero_disp8() {
        let from_rbp = Instruction::binary(
            0,
            Mnemonic::Mov,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Mem(MemRef::base(Reg::Rbp)),
        );
        assert_eq!(assemble(&[from_rbp]), vec![0x48, 0x8b, 0x45, 0x00]);

        let from_r13 = Instruction::binary(
            0,
            Mnemonic::Mov,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Mem(MemRef::base(Reg::R13)),
        );
        assert_eq!(assemble(&[from_r13]), vec![0x49, 0x8b, 0x45, 0x00]);

        let wide = Instruction::binary(
            0,
            Mnemonic::Mov,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Mem(MemRef::base_disp(Reg::Rbp, 0x100)),
        );
        assert_eq!(
            assemble(&[wide]),
            vec![0x48, 0x8b, 0x85, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn widening_moves() {
        let mut movzx = Instruction::binary(
            0,
            Mnemonic::Movzx,
            Width::W32,
            Operand::Reg(Reg::Rax),
            Operand::Mem(MemRef::base(Reg::Rdi)),
        );
        movzx.src_width = Some(Width::W8);
        assert_eq!(assemble(&[movzx]), vec![0x0f, 0xb6, 0x07]);

        let mut movsxd = Instruction::binary(
            0,
            Mnemonic::Movsx,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Reg(Reg::Rdi),
        );
        movsxd.src_width = Some(Width::W32);
        assert_eq!(assemble(&[movsxd]), vec![0x48, 0x63, 0xc7]);
    }

    #[test]
    fn stack_and_misc_forms() {
        let push = Instruction::unary(0, Mnemonic::Push, Width::W64, Operand::Reg(Reg::Rbx));
        let pop = Instruction::unary(0, Mnemonic::Pop, Width::W64, Operand::Reg(Reg::Rbx));
        let ret = Instruction::nullary(0, Mnemonic::Ret, Width::W64);
        assert_eq!(assemble(&[push, pop, ret]), vec![0x53, 0x5b, 0xc3]);

        let inc = Instruction::unary(
            0,
            Mnemonic::Inc,
            Width::W64,
            Operand::Mem(MemRef::base(Reg::Rsp)),
        );
        assert_eq!(assemble(&[inc]), vec![0x48, 0xff, 0x04, 0x24]);

        let shl = Instruction::binary(
            0,
            Mnemonic::Shl,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Imm(4),
        );
        assert_eq!(assemble(&[shl]), vec![0x48, 0xc1, 0xe0, 0x04]);
    }

    #[test]
    fn rip_relative_load_resolves_against_the_next_instruction() {
        let mut load = Instruction::binary(
            0,
            Mnemonic::Mov,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Mem(MemRef {
                base: None,
                index: None,
                scale: 1,
                disp: 0,
                segment: None,
                rip_relative: true,
            }),
        );
        load.target = Some(0x2000);
        // Instruction occupies [0x1000, 0x1007); disp = 0x2000 - 0x1007.
        assert_eq!(
            assemble(&[load]),
            vec![0x48, 0x8b, 0x05, 0xf9, 0x0f, 0x00, 0x00]
        );
    }

    #[test]
    fn near_and_far_calls() {
        let mut near = Instruction::nullary(0, Mnemonic::Call, Width::W64);
        near.target = Some(0x2000);
        assert_eq!(assemble(&[near]), vec![0xe8, 0xfb, 0x0f, 0x00, 0x00]);

        let mut far = Instruction::nullary(0, Mnemonic::Call, Width::W64);
        far.target = Some(0x1_0000_1000);
        let bytes = assemble(&[far]);
        assert_eq!(&bytes[..2], &[0x49, 0xbb]);
        assert_eq!(&bytes[2..10], &0x1_0000_1000u64.to_le_bytes());
        assert_eq!(&bytes[10..], &[0x41, 0xff, 0xd3]);
    }

    #[test]
    fn byte_register_access_forces_rex() {
        let mov = Instruction::binary(
            0,
            Mnemonic::Mov,
            Width::W8,
            Operand::Reg(Reg::Rdi),
            Operand::Imm(1),
        );
        assert_eq!(assemble(&[mov]), vec![0x40, 0xb7, 0x01]);
    }

    #[test]
    fn graph_layout_patches_branch_displacements() {
        let mut graph = CaptureGraph::new(16, 4);
        let head = graph.new_block(0x100, 1).unwrap();
        let exit = graph.new_block(0x200, 1).unwrap();
        graph.set_exit_branch(head, Cond::E);
        graph.set_taken(head, head);
        graph.set_fallthrough(head, exit);
        graph
            .push_inst(
                exit,
                CapturedInst {
                    inst: Instruction::nullary(0x200, Mnemonic::Ret, Width::W64),
                    orig: Some(0x200),
                },
            )
            .unwrap();
        graph.set_exit_return(exit);

        let code = encode_graph(&graph, 0x1000).unwrap();
        // je back to offset 0 (rel32 = -6), then the fall-through ret.
        assert_eq!(code, vec![0x0f, 0x84, 0xfa, 0xff, 0xff, 0xff, 0xc3]);
    }

    #[test]
    fn placed_jump_targets_get_an_explicit_jmp() {
        let mut graph = CaptureGraph::new(16, 4);
        let a = graph.new_block(0x100, 1).unwrap();
        graph
            .push_inst(
                a,
                CapturedInst {
                    inst: Instruction::nullary(0x100, Mnemonic::Nop, Width::W64),
                    orig: Some(0x100),
                },
            )
            .unwrap();
        graph.set_exit_jump(a, a);
        let code = encode_graph(&graph, 0x1000).unwrap();
        // nop, then jmp back to offset 0 (rel32 = -6).
        assert_eq!(code, vec![0x90, 0xe9, 0xfa, 0xff, 0xff, 0xff]);
    }
}

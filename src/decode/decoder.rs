//! Variable-length x86-64 instruction decoding.
//!
//! The decoder reads the target function's own loaded code as input data: given an address,
//! it parses legacy prefixes, REX, the opcode (primary and `0F` maps), ModRM/SIB, the
//! displacement and the immediate into an [`Instruction`], and repeats until a
//! control-transfer instruction ends the block.
//!
//! There is deliberately no best-effort mode. A mis-decoded instruction would corrupt the
//! abstract machine state silently, so the first unrecognized encoding fails the session
//! with full byte-level context.

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use log::trace;

use crate::asm::{Cond, FlowType, Instruction, MemRef, Mnemonic, Operand, Reg, Segment, Width};
use crate::decode::DecodedBlock;
use crate::{Error, Result};

/// Longest legal x86 instruction.
pub(crate) const MAX_INSN_LEN: usize = 15;

bitflags! {
    /// Legacy prefixes seen before the opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Prefixes: u8 {
        const OPSIZE   = 1 << 0;
        const ADDRSIZE = 1 << 1;
        const LOCK     = 1 << 2;
        const REP      = 1 << 3;
        const REPNE    = 1 << 4;
        const SEG_FS   = 1 << 5;
        const SEG_GS   = 1 << 6;
    }
}

bitflags! {
    /// REX prefix bits (64-bit mode).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Rex: u8 {
        const B = 1 << 0;
        const X = 1 << 1;
        const R = 1 << 2;
        const W = 1 << 3;
        /// Any REX byte was present (affects 8-bit register selection).
        const PRESENT = 1 << 4;
    }
}

/// Byte cursor over one instruction's fetch window.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    address: u64,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], address: u64) -> Cursor<'a> {
        Cursor {
            bytes,
            pos: 0,
            address,
        }
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::Decode {
            address: self.address,
            bytes: self.bytes[..self.pos.min(self.bytes.len())].to_vec(),
            message: message.into(),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| self.fail("instruction exceeds maximum length"))?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn i8(&mut self) -> Result<i64> {
        Ok(i64::from(self.u8()? as i8))
    }

    fn i16(&mut self) -> Result<i64> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(i64::from(i16::from_le_bytes([lo, hi])))
    }

    fn i32(&mut self) -> Result<i64> {
        let mut raw = [0u8; 4];
        for b in &mut raw {
            *b = self.u8()?;
        }
        Ok(i64::from(i32::from_le_bytes(raw)))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        for b in &mut raw {
            *b = self.u8()?;
        }
        Ok(i64::from_le_bytes(raw))
    }

    /// Immediate sized by operand width (imm32 sign-extends for 64-bit operations).
    fn imm(&mut self, width: Width) -> Result<i64> {
        match width {
            Width::W8 => self.i8(),
            Width::W16 => self.i16(),
            Width::W32 | Width::W64 => self.i32(),
        }
    }
}

fn reg(index: u8, ext: bool) -> Result<Reg> {
    let full = index | u8::from(ext) << 3;
    Reg::from_index(full).ok_or_else(|| Error::Decode {
        address: 0,
        bytes: Vec::new(),
        message: format!("register index {full} out of range"),
    })
}

/// Result of ModRM/SIB parsing: the reg-or-digit field and the reg-or-mem operand.
struct ModRm {
    /// ModRM.reg with REX.R applied. Either a register number or an opcode extension digit.
    reg: u8,
    /// The r/m operand: a register for mod=11, otherwise a memory reference.
    rm: Operand,
}

/// Parses a ModRM byte (and SIB/displacement if present) from the cursor.
///
/// This fills both operand slots of the two-slot ModRM contract: `reg` is returned raw so
/// the caller can treat it as a register or a group-opcode digit, and `rm` comes back as a
/// finished operand. Segment overrides and RIP-relative addressing are flags on the
/// resulting [`MemRef`], not separate code paths.
fn parse_modrm(cur: &mut Cursor<'_>, rex: Rex, segment: Option<Segment>) -> Result<ModRm> {
    let modrm = cur.u8()?;
    let md = modrm >> 6;
    let reg_field = ((modrm >> 3) & 0x7) | u8::from(rex.contains(Rex::R)) << 3;
    let rm_field = modrm & 0x7;

    if md == 0b11 {
        return Ok(ModRm {
            reg: reg_field,
            rm: Operand::Reg(reg(rm_field, rex.contains(Rex::B))?),
        });
    }

    let mut mem = MemRef {
        base: None,
        index: None,
        scale: 1,
        disp: 0,
        segment,
        rip_relative: false,
    };

    if rm_field == 0b100 {
        // SIB byte follows.
        let sib = cur.u8()?;
        let scale_bits = sib >> 6;
        let index_field = ((sib >> 3) & 0x7) | u8::from(rex.contains(Rex::X)) << 3;
        let base_field = sib & 0x7;

        mem.scale = 1 << scale_bits;
        // index=100 without REX.X means "no index"; with REX.X it addresses r12.
        if index_field != 0b100 {
            mem.index = Some(reg(index_field & 0x7, index_field >= 8)?);
        }
        if base_field == 0b101 && md == 0b00 {
            // No base, disp32 follows.
            mem.disp = cur.i32()? as i32;
        } else {
            mem.base = Some(reg(base_field, rex.contains(Rex::B))?);
        }
    } else if rm_field == 0b101 && md == 0b00 {
        // RIP-relative: disp32 against the end of the instruction.
        mem.rip_relative = true;
        mem.disp = cur.i32()? as i32;
    } else {
        mem.base = Some(reg(rm_field, rex.contains(Rex::B))?);
    }

    match md {
        0b01 => mem.disp = cur.i8()? as i32,
        0b10 => mem.disp = cur.i32()? as i32,
        _ => {}
    }

    Ok(ModRm {
        reg: reg_field,
        rm: Operand::Mem(mem),
    })
}

/// Decodes the instruction in `bytes` at `address`. `bytes` holds the fetch window
/// starting at `address`.
pub(crate) fn decode_bytes(bytes: &[u8], address: u64) -> Result<Instruction> {
    let mut cur = Cursor::new(bytes, address);

    // Prefix scan.
    let mut prefixes = Prefixes::default();
    let mut segment = None;
    loop {
        match cur.peek() {
            Some(0x66) => prefixes |= Prefixes::OPSIZE,
            Some(0x67) => prefixes |= Prefixes::ADDRSIZE,
            Some(0xf0) => prefixes |= Prefixes::LOCK,
            Some(0xf2) => prefixes |= Prefixes::REPNE,
            Some(0xf3) => prefixes |= Prefixes::REP,
            Some(0x64) => {
                prefixes |= Prefixes::SEG_FS;
                segment = Some(Segment::Fs);
            }
            Some(0x65) => {
                prefixes |= Prefixes::SEG_GS;
                segment = Some(Segment::Gs);
            }
            // CS/SS/DS/ES overrides are ignored in 64-bit mode.
            Some(0x2e | 0x36 | 0x3e | 0x26) => {}
            _ => break,
        }
        cur.u8()?;
    }

    // REX must be the last prefix before the opcode.
    let mut rex = Rex::default();
    if let Some(byte) = cur.peek() {
        if (0x40..=0x4f).contains(&byte) {
            cur.u8()?;
            rex = Rex::from_bits_truncate(byte & 0x0f) | Rex::PRESENT;
        }
    }

    let width = if rex.contains(Rex::W) {
        Width::W64
    } else if prefixes.contains(Prefixes::OPSIZE) {
        Width::W16
    } else {
        Width::W32
    };

    let opcode = cur.u8()?;
    let mut inst = match opcode {
        0x0f => decode_0f(&mut cur, rex, segment, width)?,
        _ => decode_primary(&mut cur, rex, segment, width, opcode)?,
    };

    inst.address = address;
    inst.len = u8::try_from(cur.pos).map_err(|_| cur.fail("length overflow"))?;

    // Relative targets are computed against the instruction end, which is only known now.
    if let Some(rel) = inst.target {
        inst.target = Some(inst.end().wrapping_add(rel));
    }
    Ok(inst)
}

/// Builds a two-operand instruction from an ALU opcode row.
///
/// The six classic ALU operations share an opcode layout: `base+0x00 rm8,r8`,
/// `+0x01 rm,r`, `+0x02 r8,rm8`, `+0x03 r,rm`, `+0x04 al,imm8`, `+0x05 eax,imm`.
fn alu_row(
    cur: &mut Cursor<'_>,
    rex: Rex,
    segment: Option<Segment>,
    width: Width,
    mnemonic: Mnemonic,
    variant: u8,
) -> Result<Instruction> {
    let (width, to_reg, imm_form) = match variant {
        0x00 => (Width::W8, false, false),
        0x01 => (width, false, false),
        0x02 => (Width::W8, true, false),
        0x03 => (width, true, false),
        0x04 => (Width::W8, false, true),
        0x05 => (width, false, true),
        _ => return Err(cur.fail("bad ALU variant")),
    };
    if imm_form {
        let imm = cur.imm(width)?;
        return Ok(Instruction::binary(
            0,
            mnemonic,
            width,
            Operand::Reg(Reg::Rax),
            Operand::Imm(imm),
        ));
    }
    let modrm = parse_modrm(cur, rex, segment)?;
    let r = Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?);
    let (dst, src) = if to_reg { (r, modrm.rm) } else { (modrm.rm, r) };
    Ok(Instruction::binary(0, mnemonic, width, dst, src))
}

const GROUP1: [Option<Mnemonic>; 8] = [
    Some(Mnemonic::Add),
    Some(Mnemonic::Or),
    None, // adc
    None, // sbb
    Some(Mnemonic::And),
    Some(Mnemonic::Sub),
    Some(Mnemonic::Xor),
    Some(Mnemonic::Cmp),
];

const GROUP2: [Option<Mnemonic>; 8] = [
    None, // rol
    None, // ror
    None, // rcl
    None, // rcr
    Some(Mnemonic::Shl),
    Some(Mnemonic::Shr),
    None, // shl alias
    Some(Mnemonic::Sar),
];

fn decode_primary(
    cur: &mut Cursor<'_>,
    rex: Rex,
    segment: Option<Segment>,
    width: Width,
    opcode: u8,
) -> Result<Instruction> {
    match opcode {
        // ALU rows.
        0x00..=0x05 => alu_row(cur, rex, segment, width, Mnemonic::Add, opcode),
        0x08..=0x0d => alu_row(cur, rex, segment, width, Mnemonic::Or, opcode - 0x08),
        0x20..=0x25 => alu_row(cur, rex, segment, width, Mnemonic::And, opcode - 0x20),
        0x28..=0x2d => alu_row(cur, rex, segment, width, Mnemonic::Sub, opcode - 0x28),
        0x30..=0x35 => alu_row(cur, rex, segment, width, Mnemonic::Xor, opcode - 0x30),
        0x38..=0x3d => alu_row(cur, rex, segment, width, Mnemonic::Cmp, opcode - 0x38),

        // push/pop r64. Operand size is fixed at 64 bits in long mode.
        0x50..=0x57 => Ok(Instruction::unary(
            0,
            Mnemonic::Push,
            Width::W64,
            Operand::Reg(reg(opcode - 0x50, rex.contains(Rex::B))?),
        )),
        0x58..=0x5f => Ok(Instruction::unary(
            0,
            Mnemonic::Pop,
            Width::W64,
            Operand::Reg(reg(opcode - 0x58, rex.contains(Rex::B))?),
        )),

        // movsxd r64, rm32.
        0x63 => {
            let modrm = parse_modrm(cur, rex, segment)?;
            let mut inst = Instruction::binary(
                0,
                Mnemonic::Movsx,
                width,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
                modrm.rm,
            );
            inst.src_width = Some(Width::W32);
            Ok(inst)
        }

        // push imm.
        0x68 => {
            let imm = cur.i32()?;
            Ok(Instruction::unary(
                0,
                Mnemonic::Push,
                Width::W64,
                Operand::Imm(imm),
            ))
        }
        0x6a => {
            let imm = cur.i8()?;
            Ok(Instruction::unary(
                0,
                Mnemonic::Push,
                Width::W64,
                Operand::Imm(imm),
            ))
        }

        // imul r, rm, imm.
        0x69 | 0x6b => {
            let modrm = parse_modrm(cur, rex, segment)?;
            let imm = if opcode == 0x69 {
                cur.imm(width)?
            } else {
                cur.i8()?
            };
            let mut inst = Instruction::binary(
                0,
                Mnemonic::Imul,
                width,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
                modrm.rm,
            );
            inst.src2 = Operand::Imm(imm);
            Ok(inst)
        }

        // jcc rel8.
        0x70..=0x7f => {
            let rel = cur.i8()?;
            let mut inst = Instruction::nullary(0, Mnemonic::Jcc, width);
            inst.cond = Cond::from_code(opcode - 0x70);
            inst.target = Some(rel as u64);
            Ok(inst)
        }

        // Group 1: ALU rm, imm.
        0x80 | 0x81 | 0x83 => {
            let op_width = if opcode == 0x80 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            let mnemonic = GROUP1[usize::from(modrm.reg & 0x7)]
                .ok_or_else(|| cur.fail(format!("unsupported group-1 digit /{}", modrm.reg & 0x7)))?;
            let imm = if opcode == 0x83 {
                cur.i8()?
            } else {
                cur.imm(op_width)?
            };
            Ok(Instruction::binary(
                0,
                mnemonic,
                op_width,
                modrm.rm,
                Operand::Imm(imm),
            ))
        }

        // test rm, r.
        0x84 | 0x85 => {
            let op_width = if opcode == 0x84 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            Ok(Instruction::binary(
                0,
                Mnemonic::Test,
                op_width,
                modrm.rm,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
            ))
        }

        // xchg rm, r.
        0x86 | 0x87 => {
            let op_width = if opcode == 0x86 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            Ok(Instruction::binary(
                0,
                Mnemonic::Xchg,
                op_width,
                modrm.rm,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
            ))
        }

        // mov.
        0x88 | 0x89 | 0x8a | 0x8b => {
            let op_width = if opcode & 1 == 0 { Width::W8 } else { width };
            let to_reg = opcode >= 0x8a;
            let modrm = parse_modrm(cur, rex, segment)?;
            let r = Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?);
            let (dst, src) = if to_reg { (r, modrm.rm) } else { (modrm.rm, r) };
            Ok(Instruction::binary(0, Mnemonic::Mov, op_width, dst, src))
        }

        // lea r, m.
        0x8d => {
            let modrm = parse_modrm(cur, rex, segment)?;
            if modrm.rm.as_mem().is_none() {
                return Err(cur.fail("lea requires a memory operand"));
            }
            Ok(Instruction::binary(
                0,
                Mnemonic::Lea,
                width,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
                modrm.rm,
            ))
        }

        // nop (xchg eax, eax).
        0x90 => Ok(Instruction::nullary(0, Mnemonic::Nop, width)),

        // cdqe (cwde shares the opcode but is outside the subset).
        0x98 => {
            if width != Width::W64 {
                return Err(cur.fail("cwde is not supported, only cdqe"));
            }
            Ok(Instruction::nullary(0, Mnemonic::Cdqe, width))
        }
        0x99 => Ok(Instruction::nullary(
            0,
            if width == Width::W64 {
                Mnemonic::Cqo
            } else {
                Mnemonic::Cdq
            },
            width,
        )),

        // test al/eax, imm.
        0xa8 | 0xa9 => {
            let op_width = if opcode == 0xa8 { Width::W8 } else { width };
            let imm = cur.imm(op_width)?;
            Ok(Instruction::binary(
                0,
                Mnemonic::Test,
                op_width,
                Operand::Reg(Reg::Rax),
                Operand::Imm(imm),
            ))
        }

        // mov r8, imm8.
        0xb0..=0xb7 => {
            let dst = reg(opcode - 0xb0, rex.contains(Rex::B))?;
            let imm = cur.i8()?;
            Ok(Instruction::binary(
                0,
                Mnemonic::Mov,
                Width::W8,
                Operand::Reg(dst),
                Operand::Imm(imm),
            ))
        }

        // mov r, imm (imm64 with REX.W).
        0xb8..=0xbf => {
            let dst = reg(opcode - 0xb8, rex.contains(Rex::B))?;
            let imm = if width == Width::W64 {
                cur.i64()?
            } else {
                cur.imm(width)?
            };
            Ok(Instruction::binary(
                0,
                Mnemonic::Mov,
                width,
                Operand::Reg(dst),
                Operand::Imm(imm),
            ))
        }

        // Group 2: shifts by imm8.
        0xc0 | 0xc1 => {
            let op_width = if opcode == 0xc0 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            let mnemonic = GROUP2[usize::from(modrm.reg & 0x7)]
                .ok_or_else(|| cur.fail(format!("unsupported group-2 digit /{}", modrm.reg & 0x7)))?;
            let imm = cur.i8()?;
            Ok(Instruction::binary(
                0,
                mnemonic,
                op_width,
                modrm.rm,
                Operand::Imm(imm),
            ))
        }

        // ret / ret imm16.
        0xc2 => {
            let imm = cur.i16()?;
            Ok(Instruction::unary(
                0,
                Mnemonic::Ret,
                Width::W64,
                Operand::Imm(imm),
            ))
        }
        0xc3 => Ok(Instruction::nullary(0, Mnemonic::Ret, Width::W64)),

        // mov rm, imm.
        0xc6 | 0xc7 => {
            let op_width = if opcode == 0xc6 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            if modrm.reg & 0x7 != 0 {
                return Err(cur.fail(format!("unsupported C6/C7 digit /{}", modrm.reg & 0x7)));
            }
            let imm = cur.imm(op_width)?;
            Ok(Instruction::binary(
                0,
                Mnemonic::Mov,
                op_width,
                modrm.rm,
                Operand::Imm(imm),
            ))
        }

        0xc9 => Ok(Instruction::nullary(0, Mnemonic::Leave, Width::W64)),

        // Group 2: shifts by 1 and by cl.
        0xd0 | 0xd1 | 0xd2 | 0xd3 => {
            let op_width = if opcode & 1 == 0 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            let mnemonic = GROUP2[usize::from(modrm.reg & 0x7)]
                .ok_or_else(|| cur.fail(format!("unsupported group-2 digit /{}", modrm.reg & 0x7)))?;
            let count = if opcode <= 0xd1 {
                Operand::Imm(1)
            } else {
                Operand::Reg(Reg::Rcx)
            };
            Ok(Instruction::binary(0, mnemonic, op_width, modrm.rm, count))
        }

        // call rel32.
        0xe8 => {
            let rel = cur.i32()?;
            let mut inst = Instruction::nullary(0, Mnemonic::Call, Width::W64);
            inst.target = Some(rel as u64);
            Ok(inst)
        }

        // jmp rel32 / rel8.
        0xe9 => {
            let rel = cur.i32()?;
            let mut inst = Instruction::nullary(0, Mnemonic::Jmp, Width::W64);
            inst.target = Some(rel as u64);
            Ok(inst)
        }
        0xeb => {
            let rel = cur.i8()?;
            let mut inst = Instruction::nullary(0, Mnemonic::Jmp, Width::W64);
            inst.target = Some(rel as u64);
            Ok(inst)
        }

        // Group 3.
        0xf6 | 0xf7 => {
            let op_width = if opcode == 0xf6 { Width::W8 } else { width };
            let modrm = parse_modrm(cur, rex, segment)?;
            match modrm.reg & 0x7 {
                0 | 1 => {
                    let imm = cur.imm(op_width)?;
                    Ok(Instruction::binary(
                        0,
                        Mnemonic::Test,
                        op_width,
                        modrm.rm,
                        Operand::Imm(imm),
                    ))
                }
                2 => Ok(Instruction::unary(0, Mnemonic::Not, op_width, modrm.rm)),
                3 => Ok(Instruction::unary(0, Mnemonic::Neg, op_width, modrm.rm)),
                digit => Err(cur.fail(format!("unsupported group-3 digit /{digit}"))),
            }
        }

        // Group 4/5.
        0xfe => {
            let modrm = parse_modrm(cur, rex, segment)?;
            match modrm.reg & 0x7 {
                0 => Ok(Instruction::unary(0, Mnemonic::Inc, Width::W8, modrm.rm)),
                1 => Ok(Instruction::unary(0, Mnemonic::Dec, Width::W8, modrm.rm)),
                digit => Err(cur.fail(format!("unsupported group-4 digit /{digit}"))),
            }
        }
        0xff => {
            let modrm = parse_modrm(cur, rex, segment)?;
            match modrm.reg & 0x7 {
                0 => Ok(Instruction::unary(0, Mnemonic::Inc, width, modrm.rm)),
                1 => Ok(Instruction::unary(0, Mnemonic::Dec, width, modrm.rm)),
                2 => Ok(Instruction::unary(0, Mnemonic::Call, Width::W64, modrm.rm)),
                4 => Ok(Instruction::unary(0, Mnemonic::Jmp, Width::W64, modrm.rm)),
                6 => Ok(Instruction::unary(0, Mnemonic::Push, Width::W64, modrm.rm)),
                digit => Err(cur.fail(format!("unsupported group-5 digit /{digit}"))),
            }
        }

        _ => Err(cur.fail(format!("unrecognized opcode {opcode:#04x}"))),
    }
}

fn decode_0f(
    cur: &mut Cursor<'_>,
    rex: Rex,
    segment: Option<Segment>,
    width: Width,
) -> Result<Instruction> {
    let opcode = cur.u8()?;
    match opcode {
        // Multi-byte nop: 0F 1F /0.
        0x1f => {
            let _ = parse_modrm(cur, rex, segment)?;
            Ok(Instruction::nullary(0, Mnemonic::Nop, width))
        }

        // jcc rel32.
        0x80..=0x8f => {
            let rel = cur.i32()?;
            let mut inst = Instruction::nullary(0, Mnemonic::Jcc, width);
            inst.cond = Cond::from_code(opcode - 0x80);
            inst.target = Some(rel as u64);
            Ok(inst)
        }

        // imul r, rm.
        0xaf => {
            let modrm = parse_modrm(cur, rex, segment)?;
            Ok(Instruction::binary(
                0,
                Mnemonic::Imul,
                width,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
                modrm.rm,
            ))
        }

        // movzx / movsx from 8/16-bit sources.
        0xb6 | 0xb7 | 0xbe | 0xbf => {
            let mnemonic = if opcode < 0xbe {
                Mnemonic::Movzx
            } else {
                Mnemonic::Movsx
            };
            let src_width = if opcode & 1 == 0 { Width::W8 } else { Width::W16 };
            let modrm = parse_modrm(cur, rex, segment)?;
            let mut inst = Instruction::binary(
                0,
                mnemonic,
                width,
                Operand::Reg(reg(modrm.reg & 0x7, modrm.reg >= 8)?),
                modrm.rm,
            );
            inst.src_width = Some(src_width);
            Ok(inst)
        }

        _ => Err(cur.fail(format!("unrecognized opcode 0f {opcode:#04x}"))),
    }
}

/// Decodes the single instruction located at `address` in process memory.
///
/// # Safety contract
///
/// The address must point at readable machine code; this is part of the contract the
/// caller accepts when invoking [`crate::Rewriter::rewrite`] on a target function.
pub fn decode_instruction(address: u64) -> Result<Instruction> {
    let mut window = [0u8; MAX_INSN_LEN];
    // SAFETY: covered by the rewrite() contract; the window may overrun the final
    // instruction of a function but stays within the mapped code page in practice.
    unsafe {
        std::ptr::copy_nonoverlapping(address as *const u8, window.as_mut_ptr(), MAX_INSN_LEN);
    }
    decode_bytes(&window, address)
}

/// A stateful decoder with a per-session memoization cache.
///
/// `decode(addr)` is idempotent within a session: the first request parses instructions
/// starting at `addr` until a control transfer and caches the resulting [`DecodedBlock`];
/// later requests return the cached block unchanged.
pub struct Decoder {
    cache: HashMap<u64, Rc<DecodedBlock>>,
    max_instructions: usize,
    max_blocks: usize,
    decoded_instructions: usize,
    trace: bool,
}

impl Decoder {
    /// Creates a decoder with the given session capacities.
    #[must_use]
    pub fn new(max_instructions: usize, max_blocks: usize) -> Decoder {
        Decoder {
            cache: HashMap::new(),
            max_instructions,
            max_blocks,
            decoded_instructions: 0,
            trace: false,
        }
    }

    /// Enables per-instruction decode tracing through the `log` facade.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Number of distinct blocks decoded so far in this session.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.cache.len()
    }

    /// Decodes (or returns the cached) basic block starting at `address`.
    pub fn decode(&mut self, address: u64) -> Result<Rc<DecodedBlock>> {
        if let Some(block) = self.cache.get(&address) {
            return Ok(Rc::clone(block));
        }
        if self.cache.len() >= self.max_blocks {
            return Err(Error::CaptureOverflow {
                what: "decoded blocks",
                limit: self.max_blocks,
            });
        }

        let mut instructions = Vec::new();
        let mut pc = address;
        let exit = loop {
            if self.decoded_instructions >= self.max_instructions {
                return Err(Error::CaptureOverflow {
                    what: "decoded instructions",
                    limit: self.max_instructions,
                });
            }
            let inst = decode_instruction(pc)?;
            self.decoded_instructions += 1;
            if self.trace {
                trace!("decode {:#x}: {}", inst.address, inst);
            }
            pc = inst.end();
            let flow = inst.flow_type();
            instructions.push(inst);
            if flow != FlowType::Sequential {
                break flow;
            }
        };

        let block = Rc::new(DecodedBlock {
            start: address,
            instructions,
            exit,
        });
        self.cache.insert(address, Rc::clone(&block));
        Ok(block)
    }

    /// Drops all cached blocks and resets the instruction budget.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.decoded_instructions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_buf(bytes: &[u8]) -> Instruction {
        decode_bytes(bytes, 0x1000).unwrap()
    }

    #[test]
    fn mov_reg_reg() {
        // mov rax, rdi
        let inst = decode_buf(&[0x48, 0x89, 0xf8]);
        assert_eq!(inst.mnemonic, Mnemonic::Mov);
        assert_eq!(inst.width, Width::W64);
        assert_eq!(inst.dst.as_reg(), Some(Reg::Rax));
        assert_eq!(inst.src.as_reg(), Some(Reg::Rdi));
        assert_eq!(inst.len, 3);
    }

    #[test]
    fn mov_imm64() {
        // mov rax, 0x123456789
        let inst = decode_buf(&[0x48, 0xb8, 0x89, 0x67, 0x45, 0x23, 0x01, 0, 0, 0]);
        assert_eq!(inst.mnemonic, Mnemonic::Mov);
        assert_eq!(inst.src.as_imm(), Some(0x1_2345_6789));
        assert_eq!(inst.len, 10);
    }

    #[test]
    fn add_imm8_sign_extended() {
        // add rax, 5 (group-1 83 /0)
        let inst = decode_buf(&[0x48, 0x83, 0xc0, 0x05]);
        assert_eq!(inst.mnemonic, Mnemonic::Add);
        assert_eq!(inst.dst.as_reg(), Some(Reg::Rax));
        assert_eq!(inst.src.as_imm(), Some(5));
    }

    #[test]
    fn imul_reg_reg() {
        // imul rax, rax
        let inst = decode_buf(&[0x48, 0x0f, 0xaf, 0xc0]);
        assert_eq!(inst.mnemonic, Mnemonic::Imul);
        assert_eq!(inst.dst.as_reg(), Some(Reg::Rax));
        assert_eq!(inst.src.as_reg(), Some(Reg::Rax));
    }

    #[test]
    fn memory_operand_with_sib() {
        // mov rax, [rbx + rcx*4 + 8]
        let inst = decode_buf(&[0x48, 0x8b, 0x44, 0x8b, 0x08]);
        let mem = inst.src.as_mem().expect("memory operand");
        assert_eq!(mem.base, Some(Reg::Rbx));
        assert_eq!(mem.index, Some(Reg::Rcx));
        assert_eq!(mem.scale, 4);
        assert_eq!(mem.disp, 8);
    }

    #[test]
    fn rip_relative_load() {
        // mov rax, [rip + 0x40]
        let inst = decode_buf(&[0x48, 0x8b, 0x05, 0x40, 0x00, 0x00, 0x00]);
        let mem = inst.src.as_mem().expect("memory operand");
        assert!(mem.rip_relative);
        assert_eq!(mem.disp, 0x40);
        assert_eq!(mem.base, None);
    }

    #[test]
    fn jcc_rel8_target() {
        // jge +3 at 0x1000, instruction is 2 bytes long
        let inst = decode_buf(&[0x7d, 0x03]);
        assert_eq!(inst.mnemonic, Mnemonic::Jcc);
        assert_eq!(inst.cond, Some(Cond::Ge));
        assert_eq!(inst.target, Some(0x1005));
    }

    #[test]
    fn jmp_backward() {
        // jmp -8 at 0x1000 (2-byte instruction): target 0xffa
        let inst = decode_buf(&[0xeb, 0xf8]);
        assert_eq!(inst.mnemonic, Mnemonic::Jmp);
        assert_eq!(inst.target, Some(0xffa));
    }

    #[test]
    fn push_pop_are_64bit() {
        let push = decode_buf(&[0x53]); // push rbx
        assert_eq!(push.mnemonic, Mnemonic::Push);
        assert_eq!(push.dst.as_reg(), Some(Reg::Rbx));
        assert_eq!(push.width, Width::W64);

        let pop = decode_buf(&[0x41, 0x5f]); // pop r15
        assert_eq!(pop.dst.as_reg(), Some(Reg::R15));
    }

    #[test]
    fn extended_registers() {
        // mov r10, r9
        let inst = decode_buf(&[0x4d, 0x89, 0xca]);
        assert_eq!(inst.dst.as_reg(), Some(Reg::R10));
        assert_eq!(inst.src.as_reg(), Some(Reg::R9));
    }

    #[test]
    fn operand_size_prefix() {
        // add ax, 0x1234
        let inst = decode_buf(&[0x66, 0x05, 0x34, 0x12]);
        assert_eq!(inst.width, Width::W16);
        assert_eq!(inst.src.as_imm(), Some(0x1234));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        // cpuid
        let err = decode_bytes(&[0x0f, 0xa2], 0x2000).unwrap_err();
        match err {
            Error::Decode { address, .. } => assert_eq!(address, 0x2000),
            other => panic!("expected decode error, got {other}"),
        }
    }

    #[test]
    fn block_decoding_stops_at_ret() {
        let code: [u8; 12] = [
            0x48, 0x89, 0xf8, // mov rax, rdi
            0x48, 0x0f, 0xaf, 0xc0, // imul rax, rax
            0x48, 0x83, 0xc0, 0x05, // add rax, 5
            0xc3, // ret
        ];
        let mut decoder = Decoder::new(64, 8);
        let block = decoder.decode(code.as_ptr() as u64).unwrap();
        assert_eq!(block.len(), 4);
        assert_eq!(block.exit, FlowType::Return);
        assert_eq!(block.end(), code.as_ptr() as u64 + code.len() as u64);
    }

    #[test]
    fn decode_is_memoized() {
        let code: [u8; 2] = [0x90, 0xc3]; // nop; ret
        let mut decoder = Decoder::new(64, 8);
        let addr = code.as_ptr() as u64;
        let first = decoder.decode(addr).unwrap();
        let second = decoder.decode(addr).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(decoder.block_count(), 1);
    }

    #[test]
    fn decode_capacity_enforced() {
        let code: [u8; 4] = [0x90, 0x90, 0x90, 0xc3]; // nop x3; ret
        let mut decoder = Decoder::new(2, 8);
        let err = decoder.decode(code.as_ptr() as u64).unwrap_err();
        assert!(matches!(err, Error::CaptureOverflow { .. }));
    }
}

//! Decoded and captured instruction representation.
//!
//! One [`Instruction`] struct serves both halves of the pipeline: the decoder produces them
//! from raw bytes, and the capturing emulator synthesizes new ones (with rewritten operands
//! and substituted immediates) for the encoder to re-render. Instructions are immutable once
//! built and are owned by the basic block that contains them.

use std::fmt;

use strum::{Display, EnumIter};

use crate::asm::{Operand, Reg};

/// Operand width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    /// 8-bit operand.
    W8,
    /// 16-bit operand.
    W16,
    /// 32-bit operand.
    W32,
    /// 64-bit operand.
    W64,
}

impl Width {
    /// Width in bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    /// Width in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    /// Mask selecting the low `bits()` bits of a 64-bit value.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W16 => 0xffff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }
}

/// The operation an instruction performs.
///
/// This is the practically useful subset the engine models; anything else surfaces as
/// [`crate::Error::Decode`] or [`crate::Error::Unsupported`] with full context. The
/// lowercase `Display` form doubles as the disassembly mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[allow(missing_docs)]
pub enum Mnemonic {
    Mov,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Push,
    Pop,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Imul,
    Neg,
    Not,
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
    Jmp,
    Jcc,
    Call,
    Ret,
    Leave,
    Cdq,
    Cqo,
    Cdqe,
    Nop,
}

/// x86 condition codes, in hardware encoding order (the low nibble of `0F 8x`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    /// Builds a condition from the low nibble of its opcode.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Cond> {
        use Cond::*;
        const TABLE: [Cond; 16] = [O, No, B, Ae, E, Ne, Be, A, S, Ns, P, Np, L, Ge, Le, G];
        TABLE.get(usize::from(code)).copied()
    }

    /// The hardware encoding nibble.
    #[inline]
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The opposite condition (flips the low encoding bit, matching the hardware).
    #[must_use]
    pub fn negate(self) -> Cond {
        // from_code only fails for values > 15, which xor with 1 cannot produce.
        Cond::from_code(self.code() ^ 1).unwrap_or(self)
    }

    /// Mnemonic suffix, e.g. `"ne"` for `jne`.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
        ];
        NAMES[usize::from(self.code())]
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// How an instruction affects control flow, and therefore where a basic block ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowType {
    /// Execution continues at the next instruction.
    Sequential,
    /// Unconditional transfer to the branch target.
    Jump,
    /// Two-way transfer: branch target or fall-through.
    CondJump,
    /// Call; control returns after the callee.
    Call,
    /// Function return.
    Return,
    /// Decode gave up here; the block must not be extended.
    Invalid,
}

/// A single decoded or captured instruction.
///
/// Operands are in destination-first order. Captured (synthesized) instructions reuse the
/// original instruction's address for diagnostics and set `len` to zero until encoding
/// assigns them a concrete size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Address this instruction was decoded from (or derived from, for captured ones).
    pub address: u64,
    /// Encoded length in bytes; zero for captured instructions that have not been encoded.
    pub len: u8,
    /// The operation.
    pub mnemonic: Mnemonic,
    /// Condition code, for `Jcc` only.
    pub cond: Option<Cond>,
    /// Operand width of the operation.
    pub width: Width,
    /// Source width for widening moves (`movzx`/`movsx`/`movsxd`).
    pub src_width: Option<Width>,
    /// Destination operand (also the left source for two-operand ALU forms).
    pub dst: Operand,
    /// Source operand.
    pub src: Operand,
    /// Second source operand (three-operand `imul` only).
    pub src2: Operand,
    /// Resolved absolute address: the destination of a direct control transfer, or the
    /// location referenced by a RIP-relative memory operand.
    pub target: Option<u64>,
}

impl Instruction {
    /// Builds an instruction with no operands.
    #[must_use]
    pub fn nullary(address: u64, mnemonic: Mnemonic, width: Width) -> Instruction {
        Instruction {
            address,
            len: 0,
            mnemonic,
            cond: None,
            width,
            src_width: None,
            dst: Operand::None,
            src: Operand::None,
            src2: Operand::None,
            target: None,
        }
    }

    /// Builds a one-operand instruction.
    #[must_use]
    pub fn unary(address: u64, mnemonic: Mnemonic, width: Width, dst: Operand) -> Instruction {
        Instruction {
            dst,
            ..Instruction::nullary(address, mnemonic, width)
        }
    }

    /// Builds a two-operand instruction.
    #[must_use]
    pub fn binary(
        address: u64,
        mnemonic: Mnemonic,
        width: Width,
        dst: Operand,
        src: Operand,
    ) -> Instruction {
        Instruction {
            dst,
            src,
            ..Instruction::nullary(address, mnemonic, width)
        }
    }

    /// The end address of this instruction (`address + len`).
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.address + u64::from(self.len)
    }

    /// Classifies the instruction's effect on control flow.
    #[must_use]
    pub fn flow_type(&self) -> FlowType {
        match self.mnemonic {
            Mnemonic::Jmp => FlowType::Jump,
            Mnemonic::Jcc => FlowType::CondJump,
            Mnemonic::Call => FlowType::Call,
            Mnemonic::Ret => FlowType::Return,
            _ => FlowType::Sequential,
        }
    }

    /// True if this instruction ends a decoded basic block.
    #[must_use]
    pub fn is_control_transfer(&self) -> bool {
        self.flow_type() != FlowType::Sequential
    }

    /// Convenience for `mov reg, imm` synthesis during capture.
    #[must_use]
    pub fn mov_reg_imm(address: u64, reg: Reg, value: i64) -> Instruction {
        Instruction::binary(
            address,
            Mnemonic::Mov,
            Width::W64,
            Operand::Reg(reg),
            Operand::Imm(value),
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mnemonic {
            Mnemonic::Jcc => {
                let cond = self.cond.map(|c| c.suffix()).unwrap_or("??");
                write!(f, "j{cond}")?;
            }
            m => write!(f, "{m}")?,
        }
        if let Some(target) = self.target {
            if self.is_control_transfer() {
                return write!(f, " {target:#x}");
            }
        }
        let mut sep = " ";
        for (slot, width) in [
            (&self.dst, self.width),
            (&self.src, self.src_width.unwrap_or(self.width)),
            (&self.src2, self.width),
        ] {
            if slot.is_none() {
                continue;
            }
            f.write_str(sep)?;
            slot.fmt_width(f, width)?;
            sep = ", ";
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::MemRef;

    #[test]
    fn cond_negation_flips_low_bit() {
        assert_eq!(Cond::E.negate(), Cond::Ne);
        assert_eq!(Cond::Ne.negate(), Cond::E);
        assert_eq!(Cond::L.negate(), Cond::Ge);
        assert_eq!(Cond::A.negate(), Cond::Be);
    }

    #[test]
    fn cond_code_roundtrip() {
        for code in 0..16 {
            let cond = Cond::from_code(code).unwrap();
            assert_eq!(cond.code(), code);
        }
        assert!(Cond::from_code(16).is_none());
    }

    #[test]
    fn display_mov_reg_imm() {
        let inst = Instruction::mov_reg_imm(0x1000, Reg::Rax, 5);
        assert_eq!(inst.to_string(), "mov rax, 0x5");
    }

    #[test]
    fn display_mem_operand() {
        let inst = Instruction::binary(
            0x1000,
            Mnemonic::Mov,
            Width::W64,
            Operand::Reg(Reg::Rax),
            Operand::Mem(MemRef::base_disp(Reg::Rsp, 8)),
        );
        assert_eq!(inst.to_string(), "mov rax, [rsp + 0x8]");
    }

    #[test]
    fn display_jcc_target() {
        let mut inst = Instruction::nullary(0x1000, Mnemonic::Jcc, Width::W64);
        inst.cond = Some(Cond::G);
        inst.target = Some(0x1010);
        assert_eq!(inst.to_string(), "jg 0x1010");
    }

    #[test]
    fn flow_types() {
        assert_eq!(
            Instruction::nullary(0, Mnemonic::Ret, Width::W64).flow_type(),
            FlowType::Return
        );
        assert_eq!(
            Instruction::nullary(0, Mnemonic::Add, Width::W64).flow_type(),
            FlowType::Sequential
        );
        assert!(Instruction::nullary(0, Mnemonic::Jmp, Width::W64).is_control_transfer());
    }
}

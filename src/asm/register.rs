//! General-purpose register model for 64-bit mode.
//!
//! Registers are represented by their hardware encoding index (0-15) rather than by one
//! variant per width: the operand width lives on the instruction, which keeps the decoder's
//! ModRM handling and the encoder's REX synthesis to simple index arithmetic.

use std::fmt;

use crate::asm::Width;

/// An x86-64 general-purpose register, identified by its 4-bit hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    /// Accumulator (RAX), encoding 0.
    Rax = 0,
    /// Counter (RCX), encoding 1.
    Rcx = 1,
    /// Data (RDX), encoding 2.
    Rdx = 2,
    /// Base (RBX), encoding 3.
    Rbx = 3,
    /// Stack pointer (RSP), encoding 4.
    Rsp = 4,
    /// Frame pointer (RBP), encoding 5.
    Rbp = 5,
    /// Source index (RSI), encoding 6.
    Rsi = 6,
    /// Destination index (RDI), encoding 7.
    Rdi = 7,
    /// Extended register R8, encoding 8.
    R8 = 8,
    /// Extended register R9, encoding 9.
    R9 = 9,
    /// Extended register R10, encoding 10.
    R10 = 10,
    /// Extended register R11, encoding 11.
    R11 = 11,
    /// Extended register R12, encoding 12.
    R12 = 12,
    /// Extended register R13, encoding 13.
    R13 = 13,
    /// Extended register R14, encoding 14.
    R14 = 14,
    /// Extended register R15, encoding 15.
    R15 = 15,
}

/// All sixteen general-purpose registers in encoding order.
pub const GP_REGS: [Reg; 16] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsp,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// SysV AMD64 integer argument registers, in argument order.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// SysV AMD64 caller-saved (volatile) registers, clobbered by an opaque call.
pub const CALLER_SAVED: [Reg; 9] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

impl Reg {
    /// Returns the 4-bit hardware encoding of this register.
    #[inline]
    #[must_use]
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Builds a register from its 4-bit hardware encoding.
    ///
    /// Returns `None` for indices above 15.
    #[must_use]
    pub fn from_index(index: u8) -> Option<Reg> {
        GP_REGS.get(usize::from(index)).copied()
    }

    /// True for R8-R15, which need a REX extension bit in their encodings.
    #[inline]
    #[must_use]
    pub fn is_extended(self) -> bool {
        self.index() >= 8
    }

    /// Returns the conventional name of this register at the given operand width.
    ///
    /// Only the REX-addressable low-byte forms are produced for 8-bit widths (SPL/BPL/SIL/DIL
    /// rather than AH/CH/DH/BH); the decoder rejects high-byte registers.
    #[must_use]
    pub fn name(self, width: Width) -> &'static str {
        const N64: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        const N32: [&str; 16] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
            "r12d", "r13d", "r14d", "r15d",
        ];
        const N16: [&str; 16] = [
            "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
            "r13w", "r14w", "r15w",
        ];
        const N8: [&str; 16] = [
            "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b",
            "r12b", "r13b", "r14b", "r15b",
        ];
        let i = usize::from(self.index());
        match width {
            Width::W64 => N64[i],
            Width::W32 => N32[i],
            Width::W16 => N16[i],
            Width::W8 => N8[i],
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name(Width::W64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_roundtrip() {
        for reg in GP_REGS {
            assert_eq!(Reg::from_index(reg.index()), Some(reg));
        }
        assert_eq!(Reg::from_index(16), None);
    }

    #[test]
    fn names_by_width() {
        assert_eq!(Reg::Rax.name(Width::W64), "rax");
        assert_eq!(Reg::Rax.name(Width::W32), "eax");
        assert_eq!(Reg::Rax.name(Width::W8), "al");
        assert_eq!(Reg::R10.name(Width::W16), "r10w");
    }

    #[test]
    fn extended_detection() {
        assert!(!Reg::Rdi.is_extended());
        assert!(Reg::R8.is_extended());
    }
}

//! Operand and memory-reference model.
//!
//! Operands are inlined into the [`crate::asm::Instruction`] that references them; a memory
//! reference never outlives its instruction and is never separately owned. Value widths are
//! carried on the instruction, not on the operand, mirroring how the hardware encodes them.

use std::fmt;

use crate::asm::{Reg, Width};

/// Segment-override prefixes that are still meaningful in 64-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// FS-relative addressing (thread-local data on Linux).
    Fs,
    /// GS-relative addressing.
    Gs,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Fs => f.write_str("fs"),
            Segment::Gs => f.write_str("gs"),
        }
    }
}

/// A decoded memory reference: `[base + index*scale + disp]` with an optional segment
/// override, or a RIP-relative displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    /// Base register, if any.
    pub base: Option<Reg>,
    /// Index register, if any. Never RSP (the encoding cannot express it).
    pub index: Option<Reg>,
    /// Index scale factor: 1, 2, 4 or 8.
    pub scale: u8,
    /// Signed displacement.
    pub disp: i32,
    /// Segment override, if one was prefixed.
    pub segment: Option<Segment>,
    /// True for RIP-relative addressing (`mod=00, rm=101` in 64-bit mode). When set,
    /// `base` and `index` are `None` and `disp` is relative to the end of the instruction.
    pub rip_relative: bool,
}

impl MemRef {
    /// A plain `[base]` reference.
    #[must_use]
    pub fn base(base: Reg) -> MemRef {
        MemRef {
            base: Some(base),
            index: None,
            scale: 1,
            disp: 0,
            segment: None,
            rip_relative: false,
        }
    }

    /// A `[base + disp]` reference.
    #[must_use]
    pub fn base_disp(base: Reg, disp: i32) -> MemRef {
        MemRef {
            disp,
            ..MemRef::base(base)
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        if let Some(seg) = self.segment {
            write!(f, "{seg}:")?;
        }
        let mut wrote = false;
        if self.rip_relative {
            f.write_str("rip")?;
            wrote = true;
        }
        if let Some(base) = self.base {
            write!(f, "{base}")?;
            wrote = true;
        }
        if let Some(index) = self.index {
            if wrote {
                f.write_str(" + ")?;
            }
            write!(f, "{index}*{}", self.scale)?;
            wrote = true;
        }
        if self.disp != 0 || !wrote {
            if wrote {
                if self.disp < 0 {
                    write!(f, " - {:#x}", i64::from(self.disp).unsigned_abs())?;
                } else {
                    write!(f, " + {:#x}", self.disp)?;
                }
            } else {
                write!(f, "{:#x}", self.disp)?;
            }
        }
        f.write_str("]")
    }
}

/// An instruction operand.
///
/// The `None` variant fills unused slots; instructions carry up to three operands in
/// destination-first order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    /// Unused operand slot.
    #[default]
    None,
    /// A general-purpose register.
    Reg(Reg),
    /// A memory reference, inlined.
    Mem(MemRef),
    /// An immediate, sign-extended to 64 bits.
    Imm(i64),
}

impl Operand {
    /// Returns the register if this operand is one.
    #[must_use]
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// Returns the memory reference if this operand is one.
    #[must_use]
    pub fn as_mem(&self) -> Option<&MemRef> {
        match self {
            Operand::Mem(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the immediate value if this operand is one.
    #[must_use]
    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }

    /// True for the unused slot marker.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    /// Renders the operand at a given width (registers change name with width).
    pub(crate) fn fmt_width(&self, f: &mut fmt::Formatter<'_>, width: Width) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Reg(r) => f.write_str(r.name(width)),
            Operand::Mem(m) => write!(f, "{m}"),
            Operand::Imm(v) => {
                if *v < 0 {
                    write!(f, "-{:#x}", v.unsigned_abs())
                } else {
                    write!(f, "{v:#x}")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memref_display() {
        let m = MemRef {
            base: Some(Reg::Rbx),
            index: Some(Reg::Rcx),
            scale: 4,
            disp: 8,
            segment: None,
            rip_relative: false,
        };
        assert_eq!(m.to_string(), "[rbx + rcx*4 + 0x8]");

        let m = MemRef::base_disp(Reg::Rsp, -16);
        assert_eq!(m.to_string(), "[rsp - 0x10]");

        let m = MemRef {
            base: None,
            index: None,
            scale: 1,
            disp: 0x40,
            segment: None,
            rip_relative: true,
        };
        assert_eq!(m.to_string(), "[rip + 0x40]");
    }

    #[test]
    fn operand_accessors() {
        assert_eq!(Operand::Reg(Reg::Rax).as_reg(), Some(Reg::Rax));
        assert_eq!(Operand::Imm(-1).as_imm(), Some(-1));
        assert!(Operand::None.is_none());
        assert!(Operand::Mem(MemRef::base(Reg::Rdi)).as_mem().is_some());
    }
}

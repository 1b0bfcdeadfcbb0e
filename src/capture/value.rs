//! The two-valued abstract domain of the capturing emulator.
//!
//! Every storage location the emulator tracks is either *Static* (its value is known at
//! capture time and participates in constant folding) or *Dynamic* (it will only be computed
//! by the generated code at run time). [`CaptureValue::StackRel`] is the frame-relative
//! refinement of Static used for stack-pointer tracking: the value equals the caller's entry
//! RSP plus a known offset, which folds through address arithmetic but is Dynamic as data
//! (its absolute run-time value is unknown while capturing).
//!
//! The type is an explicit sum with exhaustive matching everywhere it is consumed; there is
//! deliberately no path that treats an unknown value as zero.

use crate::asm::{Mnemonic, Width};

/// Abstract value of one register or stack slot during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureValue {
    /// Known 64-bit value (stored in two's complement; narrower operations mask it).
    Static(u64),
    /// Entry-RSP plus the given byte offset. Known relative to the frame, unknown
    /// absolutely.
    StackRel(i64),
    /// Unknown until the generated code runs. The run-time home of a dynamic value is its
    /// architectural location: this engine inherits the original register allocation.
    Dynamic,
}

impl CaptureValue {
    /// True for [`CaptureValue::Static`].
    #[must_use]
    pub fn is_static(self) -> bool {
        matches!(self, CaptureValue::Static(_))
    }

    /// True for [`CaptureValue::Dynamic`].
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        matches!(self, CaptureValue::Dynamic)
    }

    /// The concrete value, if static.
    #[must_use]
    pub fn as_static(self) -> Option<u64> {
        match self {
            CaptureValue::Static(v) => Some(v),
            CaptureValue::StackRel(_) | CaptureValue::Dynamic => None,
        }
    }

    /// True if the value folds through computation (static or frame-relative).
    #[must_use]
    pub fn is_known(self) -> bool {
        !self.is_dynamic()
    }
}

/// Sign-extends the low `width` bits of `v`.
#[inline]
#[must_use]
pub fn sign_extend(v: u64, width: Width) -> i64 {
    let shift = 64 - width.bits();
    ((v << shift) as i64) >> shift
}

/// True if a static value can be encoded as the sign-extended immediate of an operation
/// at the given width.
#[must_use]
pub fn fits_imm(v: u64, width: Width) -> bool {
    match width {
        Width::W8 | Width::W16 | Width::W32 => true,
        // 64-bit operations carry imm32, sign-extended.
        Width::W64 => i32::try_from(v as i64).is_ok(),
    }
}

/// Computes a two-operand ALU result over fully static inputs.
///
/// Inputs and result are masked to the operation width; the result comes back
/// zero-extended, matching how a 32-bit destination write clears the upper half. Returns
/// `None` for operations whose result the emulator does not fold.
#[must_use]
pub fn alu_static(mnemonic: Mnemonic, width: Width, a: u64, b: u64) -> Option<u64> {
    let mask = width.mask();
    let (a, b) = (a & mask, b & mask);
    let result = match mnemonic {
        Mnemonic::Add => a.wrapping_add(b),
        Mnemonic::Sub | Mnemonic::Cmp => a.wrapping_sub(b),
        Mnemonic::And | Mnemonic::Test => a & b,
        Mnemonic::Or => a | b,
        Mnemonic::Xor => a ^ b,
        Mnemonic::Imul => {
            (sign_extend(a, width).wrapping_mul(sign_extend(b, width))) as u64
        }
        Mnemonic::Shl => {
            let count = shift_count(b, width);
            if count == 0 { a } else { a << count }
        }
        Mnemonic::Shr => {
            let count = shift_count(b, width);
            if count == 0 { a } else { a >> count }
        }
        Mnemonic::Sar => {
            let count = shift_count(b, width);
            (sign_extend(a, width) >> count) as u64
        }
        _ => return None,
    };
    Some(result & mask)
}

/// Computes a one-operand ALU result over a static input.
#[must_use]
pub fn alu_static_unary(mnemonic: Mnemonic, width: Width, a: u64) -> Option<u64> {
    let mask = width.mask();
    let a = a & mask;
    let result = match mnemonic {
        Mnemonic::Neg => a.wrapping_neg(),
        Mnemonic::Not => !a,
        Mnemonic::Inc => a.wrapping_add(1),
        Mnemonic::Dec => a.wrapping_sub(1),
        _ => return None,
    };
    Some(result & mask)
}

fn shift_count(b: u64, width: Width) -> u32 {
    let raw = b as u32;
    if width == Width::W64 {
        raw & 63
    } else {
        raw & 31
    }
}

/// Folds a two-operand ALU over abstract values.
///
/// Frame-relative values participate only in 64-bit additive arithmetic: adding or
/// subtracting a static offset keeps a value frame-relative, and the difference of two
/// frame-relative values is static. Every other mix degrades to Dynamic.
#[must_use]
pub fn alu_abstract(
    mnemonic: Mnemonic,
    width: Width,
    a: CaptureValue,
    b: CaptureValue,
) -> CaptureValue {
    use CaptureValue::{Dynamic, StackRel, Static};
    match (a, b) {
        (Static(x), Static(y)) => match alu_static(mnemonic, width, x, y) {
            Some(v) => Static(v),
            None => Dynamic,
        },
        (StackRel(d), Static(v)) if width == Width::W64 => match mnemonic {
            Mnemonic::Add => StackRel(d.wrapping_add(v as i64)),
            Mnemonic::Sub => StackRel(d.wrapping_sub(v as i64)),
            _ => Dynamic,
        },
        (Static(v), StackRel(d)) if width == Width::W64 && mnemonic == Mnemonic::Add => {
            StackRel(d.wrapping_add(v as i64))
        }
        (StackRel(x), StackRel(y)) if width == Width::W64 && mnemonic == Mnemonic::Sub => {
            Static(x.wrapping_sub(y) as u64)
        }
        _ => Dynamic,
    }
}

/// Merges a width-masked result into the previous contents of a register.
///
/// 64-bit writes replace, 32-bit writes zero-extend, 8/16-bit writes preserve the upper
/// bits (which requires the previous value to be static too).
#[must_use]
pub fn merge_write(previous: CaptureValue, result: u64, width: Width) -> CaptureValue {
    match width {
        Width::W64 => CaptureValue::Static(result),
        Width::W32 => CaptureValue::Static(result & Width::W32.mask()),
        Width::W8 | Width::W16 => match previous {
            CaptureValue::Static(old) => {
                CaptureValue::Static((old & !width.mask()) | (result & width.mask()))
            }
            CaptureValue::StackRel(_) | CaptureValue::Dynamic => CaptureValue::Dynamic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CaptureValue::{Dynamic, StackRel, Static};

    #[test]
    fn static_add_masks_width() {
        assert_eq!(
            alu_static(Mnemonic::Add, Width::W32, 0xffff_ffff, 1),
            Some(0)
        );
        assert_eq!(alu_static(Mnemonic::Add, Width::W64, u64::MAX, 1), Some(0));
    }

    #[test]
    fn imul_is_signed() {
        assert_eq!(
            alu_static(Mnemonic::Imul, Width::W64, (-3i64) as u64, 4),
            Some((-12i64) as u64)
        );
    }

    #[test]
    fn sar_sign_extends() {
        let v = alu_static(Mnemonic::Sar, Width::W32, 0x8000_0000, 4).unwrap();
        assert_eq!(v, 0xf800_0000);
    }

    #[test]
    fn stack_rel_arithmetic() {
        assert_eq!(
            alu_abstract(Mnemonic::Sub, Width::W64, StackRel(-8), Static(16)),
            StackRel(-24)
        );
        assert_eq!(
            alu_abstract(Mnemonic::Add, Width::W64, StackRel(-8), Static(8)),
            StackRel(0)
        );
        assert_eq!(
            alu_abstract(Mnemonic::Sub, Width::W64, StackRel(-8), StackRel(-24)),
            Static(16)
        );
        // Alignment masks on the frame pointer are not representable.
        assert_eq!(
            alu_abstract(Mnemonic::And, Width::W64, StackRel(-8), Static(!15)),
            Dynamic
        );
    }

    #[test]
    fn dynamic_poisons_results() {
        assert_eq!(
            alu_abstract(Mnemonic::Add, Width::W64, Dynamic, Static(1)),
            Dynamic
        );
    }

    #[test]
    fn narrow_write_merges() {
        assert_eq!(
            merge_write(Static(0x1122_3344_5566_7788), 0xaa, Width::W8),
            Static(0x1122_3344_5566_77aa)
        );
        assert_eq!(merge_write(Dynamic, 0xaa, Width::W8), Dynamic);
        assert_eq!(
            merge_write(Static(0xdead_beef_0000_0000), 0x1234, Width::W32),
            Static(0x1234)
        );
    }

    #[test]
    fn imm_fit() {
        assert!(fits_imm(5, Width::W64));
        assert!(fits_imm((-5i64) as u64, Width::W64));
        assert!(!fits_imm(0x1_0000_0000, Width::W64));
        assert!(fits_imm(0xffff_ffff, Width::W32));
    }
}

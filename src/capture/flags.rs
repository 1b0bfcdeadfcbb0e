//! Symbolic flag tracking for static branch resolution.
//!
//! Instead of modelling EFLAGS bit by bit, the emulator remembers *which operation last
//! wrote the flags and with what operands*. When a conditional branch is reached, the
//! condition is evaluated directly against that producer; if the producer's operands were
//! static the branch direction is known and no compare or branch needs to be captured.
//!
//! A [`FlagState`] carries two producers: the *known* one, filled only when every operand
//! was static (this is what folding and state hashing use), and the *sampled* one, filled
//! from the concrete shadow values of the first capture run (consulted only when the
//! caller opted into assuming unknown branch directions).

use crate::asm::{Cond, Width};

/// The operation that last defined the flags, with static operand values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlagProducer {
    /// Flags were clobbered by something with non-static inputs (or an opaque call).
    #[default]
    Unknown,
    /// `cmp a, b` or `sub a, b` at the given width.
    Cmp {
        /// Left operand (minuend).
        left: u64,
        /// Right operand (subtrahend).
        right: u64,
        /// Operation width.
        width: Width,
    },
    /// `test a, b` at the given width.
    Test {
        /// Left operand.
        left: u64,
        /// Right operand.
        right: u64,
        /// Operation width.
        width: Width,
    },
    /// `add a, b` at the given width.
    Add {
        /// Left operand.
        left: u64,
        /// Right operand.
        right: u64,
        /// Operation width.
        width: Width,
    },
    /// A logic operation (`and`/`or`/`xor`); carry and overflow are cleared.
    Logic {
        /// The masked result.
        result: u64,
        /// Operation width.
        width: Width,
    },
    /// An operation where only the result is known (`inc`/`dec`/`neg`/shifts): zero, sign
    /// and parity can be evaluated, carry and overflow cannot.
    Result {
        /// The masked result.
        result: u64,
        /// Operation width.
        width: Width,
    },
}

/// Concrete flag bits derived from a producer.
#[derive(Debug, Clone, Copy)]
struct FlagBits {
    zf: bool,
    sf: bool,
    pf: bool,
    /// `None` when the producer cannot determine the bit.
    cf: Option<bool>,
    of: Option<bool>,
}

fn result_bits(result: u64, width: Width, cf: Option<bool>, of: Option<bool>) -> FlagBits {
    let masked = result & width.mask();
    FlagBits {
        zf: masked == 0,
        sf: (masked >> (width.bits() - 1)) & 1 == 1,
        pf: (masked & 0xff).count_ones() % 2 == 0,
        cf,
        of,
    }
}

impl FlagProducer {
    fn bits(self) -> Option<FlagBits> {
        match self {
            FlagProducer::Unknown => None,
            FlagProducer::Cmp { left, right, width } => {
                let (a, b) = (left & width.mask(), right & width.mask());
                let result = a.wrapping_sub(b) & width.mask();
                let cf = a < b;
                let of = ((a ^ b) & (a ^ result)) >> (width.bits() - 1) & 1 == 1;
                Some(result_bits(result, width, Some(cf), Some(of)))
            }
            FlagProducer::Add { left, right, width } => {
                let (a, b) = (left & width.mask(), right & width.mask());
                let result = a.wrapping_add(b) & width.mask();
                let cf = result < a;
                let of = (!(a ^ b) & (a ^ result)) >> (width.bits() - 1) & 1 == 1;
                Some(result_bits(result, width, Some(cf), Some(of)))
            }
            FlagProducer::Test { left, right, width } => {
                let result = left & right;
                Some(result_bits(result, width, Some(false), Some(false)))
            }
            FlagProducer::Logic { result, width } => {
                Some(result_bits(result, width, Some(false), Some(false)))
            }
            FlagProducer::Result { result, width } => {
                Some(result_bits(result, width, None, None))
            }
        }
    }

    /// Evaluates a condition code against this producer. `None` if the producer does not
    /// determine the condition.
    #[must_use]
    pub fn eval(self, cond: Cond) -> Option<bool> {
        let bits = self.bits()?;
        match cond {
            Cond::O => bits.of,
            Cond::No => bits.of.map(|v| !v),
            Cond::B => bits.cf,
            Cond::Ae => bits.cf.map(|v| !v),
            Cond::E => Some(bits.zf),
            Cond::Ne => Some(!bits.zf),
            Cond::Be => bits.cf.map(|cf| cf || bits.zf),
            Cond::A => bits.cf.map(|cf| !cf && !bits.zf),
            Cond::S => Some(bits.sf),
            Cond::Ns => Some(!bits.sf),
            Cond::P => Some(bits.pf),
            Cond::Np => Some(!bits.pf),
            Cond::L => bits.of.map(|of| bits.sf != of),
            Cond::Ge => bits.of.map(|of| bits.sf == of),
            Cond::Le => bits.of.map(|of| bits.zf || bits.sf != of),
            Cond::G => bits.of.map(|of| !bits.zf && bits.sf == of),
        }
    }
}

/// The emulator's view of EFLAGS: one producer from static values, one from samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlagState {
    /// Producer with fully static operands; drives folding and state identity.
    pub known: FlagProducer,
    /// Producer rebuilt from concrete shadow samples; consulted only under the
    /// assume-known-branches policy and never hashed.
    pub sampled: FlagProducer,
}

impl FlagState {
    /// Both producers unknown (function entry, after opaque calls).
    #[must_use]
    pub fn unknown() -> FlagState {
        FlagState::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_signed_conditions() {
        let p = FlagProducer::Cmp {
            left: (-5i64) as u64,
            right: 3,
            width: Width::W64,
        };
        assert_eq!(p.eval(Cond::L), Some(true));
        assert_eq!(p.eval(Cond::G), Some(false));
        assert_eq!(p.eval(Cond::Ne), Some(true));
        // Unsigned: -5 as u64 is huge.
        assert_eq!(p.eval(Cond::A), Some(true));
        assert_eq!(p.eval(Cond::B), Some(false));
    }

    #[test]
    fn cmp_equality() {
        let p = FlagProducer::Cmp {
            left: 7,
            right: 7,
            width: Width::W32,
        };
        assert_eq!(p.eval(Cond::E), Some(true));
        assert_eq!(p.eval(Cond::Le), Some(true));
        assert_eq!(p.eval(Cond::L), Some(false));
    }

    #[test]
    fn cmp_overflow() {
        // i32::MIN - 1 overflows: SF and OF disagree about the true sign.
        let p = FlagProducer::Cmp {
            left: 0x8000_0000,
            right: 1,
            width: Width::W32,
        };
        assert_eq!(p.eval(Cond::L), Some(true));
        assert_eq!(p.eval(Cond::O), Some(true));
    }

    #[test]
    fn test_clears_carry_and_overflow() {
        let p = FlagProducer::Test {
            left: 0xff,
            right: 0x0f,
            width: Width::W8,
        };
        assert_eq!(p.eval(Cond::B), Some(false));
        assert_eq!(p.eval(Cond::E), Some(false));
        assert_eq!(p.eval(Cond::A), Some(true));
    }

    #[test]
    fn result_only_producer_limits_conditions() {
        let p = FlagProducer::Result {
            result: 0,
            width: Width::W64,
        };
        assert_eq!(p.eval(Cond::E), Some(true));
        assert_eq!(p.eval(Cond::S), Some(false));
        assert_eq!(p.eval(Cond::L), None);
        assert_eq!(p.eval(Cond::B), None);
    }

    #[test]
    fn unknown_producer_evaluates_nothing() {
        assert_eq!(FlagProducer::Unknown.eval(Cond::E), None);
    }

    #[test]
    fn add_carry() {
        let p = FlagProducer::Add {
            left: u64::MAX,
            right: 1,
            width: Width::W64,
        };
        assert_eq!(p.eval(Cond::B), Some(true));
        assert_eq!(p.eval(Cond::E), Some(true));
    }
}

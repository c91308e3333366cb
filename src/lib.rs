//! # gwexp — Verifiable Modular Exponentiation Engine
//!
//! Computes X = base^E mod N for the huge moduli that show up in primality
//! and probable-prime testing of numbers of the form k*b^n ± c, emitting
//! intermediate residues at caller-chosen checkpoint iterations and
//! surviving crashes, transient FFT roundoff errors and silent soft
//! errors.
//!
//! ## Drivers
//!
//! - [`fast_exp::FastExp`] — binary exponentiation with a small base folded
//!   into the multiplier's mul-by-const path.
//! - [`slow_exp::SlowExp`] — binary exponentiation with an arbitrary base
//!   residue.
//! - [`multipoint::MultipointExp`] — drives base^(b^p) across a checkpoint
//!   schedule with sliding-window segment exponentiation.
//! - [`gerbicz::GerbiczCheckExp`] — the multipoint driver plus the Gerbicz
//!   redundant accumulator: every L² iterations a careful-mode consistency
//!   check either certifies the block or rewinds to the last verified
//!   residue.
//!
//! ## Backends
//!
//! Arithmetic goes through the [`arith::FftArith`] contract. The portable
//! [`arith::SoftFft`] backend (rug/GMP) is always available; the GWNUM
//! IBDWT backend is compiled in with the `gwnum` feature and links
//! `gwnum.a` via the `gwnum-sys` crate.
//!
//! ## Persistence
//!
//! Drivers commit state on a multiplication-count cadence and persist it
//! through [`state::StateFile`] (atomic single-record JSON). The Gerbicz
//! driver keeps two files: a frequently-written working state and a
//! recovery state rewritten only at verified block boundaries.

pub mod arith;
pub mod fast_exp;
pub mod gerbicz;
pub mod input;
pub mod multipoint;
pub mod progress;
pub mod slow_exp;
pub mod state;
pub mod task;

/// Convert a `u64` exponent to `u32` for `rug::Integer::pow()`, panicking
/// with a clear message if the value exceeds `u32::MAX`. This prevents
/// silent truncation that would produce wrong residues.
#[inline]
pub fn checked_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or_else(|_| {
        panic!(
            "exponent {} exceeds u32::MAX ({}); residue would be silently wrong",
            n,
            u32::MAX
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_u32_valid_values() {
        assert_eq!(checked_u32(0), 0);
        assert_eq!(checked_u32(1), 1);
        assert_eq!(checked_u32(u32::MAX as u64), u32::MAX);
    }

    #[test]
    #[should_panic(expected = "exceeds u32::MAX")]
    fn checked_u32_overflow_panics() {
        checked_u32(u32::MAX as u64 + 1);
    }
}

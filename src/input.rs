//! The input number N = k*b^n + c being worked modulo.
//!
//! Carries the algebraic form (not just the value): the FFT backend needs
//! k, b, n, c separately to pick a weighted transform, and the display
//! form is used as the logging prefix.

use anyhow::{anyhow, Result};
use rug::ops::Pow;
use rug::Integer;

use crate::arith::{FftArith, GwError};
use crate::checked_u32;

/// A number of the form k*b^n + c with k ≥ 1, b ≥ 2, n ≥ 1 and c = ±|c|.
///
/// The value must be positive and odd forms like (2^p+1)/3 are out of scope
/// here — this engine works modulo the full k*b^n+c.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputNum {
    k: u64,
    b: u32,
    n: u64,
    c: i64,
}

impl InputNum {
    pub fn new(k: u64, b: u32, n: u64, c: i64) -> Result<Self> {
        if k == 0 {
            return Err(anyhow!("k must be positive"));
        }
        if b < 2 {
            return Err(anyhow!("base must be at least 2"));
        }
        if n == 0 {
            return Err(anyhow!("exponent must be at least 1"));
        }
        let input = InputNum { k, b, n, c };
        if input.value() <= 1u32 {
            return Err(anyhow!("{} is not a valid modulus", input.display_text()));
        }
        Ok(input)
    }

    /// Parse an expression like "3*2^50000+1", "2^61-1" or "5*3^100+7".
    pub fn parse(expr: &str) -> Result<Self> {
        let expr: String = expr.chars().filter(|ch| !ch.is_whitespace()).collect();
        let (kb, b_rest) = match expr.find('*') {
            Some(star) => {
                let k: u64 = expr[..star]
                    .parse()
                    .map_err(|_| anyhow!("invalid k in: {}", expr))?;
                (k, &expr[star + 1..])
            }
            None => (1, expr.as_str()),
        };
        let caret = b_rest
            .find('^')
            .ok_or_else(|| anyhow!("no '^' in expression: {}", expr))?;
        let b: u32 = b_rest[..caret]
            .parse()
            .map_err(|_| anyhow!("invalid base in: {}", expr))?;
        let after = &b_rest[caret + 1..];
        let sign_pos = after
            .find(['+', '-'])
            .ok_or_else(|| anyhow!("no +c/-c term in expression: {}", expr))?;
        let n: u64 = after[..sign_pos]
            .parse()
            .map_err(|_| anyhow!("invalid exponent in: {}", expr))?;
        let c: i64 = after[sign_pos..]
            .parse()
            .map_err(|_| anyhow!("invalid c in: {}", expr))?;
        InputNum::new(kb, b, n, c)
    }

    pub fn k(&self) -> u64 {
        self.k
    }

    pub fn b(&self) -> u32 {
        self.b
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn c(&self) -> i64 {
        self.c
    }

    /// The modulus value: k*b^n + c.
    pub fn value(&self) -> Integer {
        let mut v = Integer::from(self.k) * Integer::from(self.b).pow(checked_u32(self.n));
        v += self.c;
        v
    }

    /// Display form, e.g. "3*2^50000+1" or "2^61-1".
    pub fn display_text(&self) -> String {
        let sign = if self.c < 0 { '-' } else { '+' };
        if self.k == 1 {
            format!("{}^{}{}{}", self.b, self.n, sign, self.c.unsigned_abs())
        } else {
            format!(
                "{}*{}^{}{}{}",
                self.k,
                self.b,
                self.n,
                sign,
                self.c.unsigned_abs()
            )
        }
    }

    /// Bit length of the modulus.
    pub fn bitlen(&self) -> u32 {
        self.value().significant_bits()
    }

    /// Configure an FFT backend for arithmetic modulo this number.
    pub fn setup<B: FftArith>(&self, gw: &mut B) -> std::result::Result<(), GwError> {
        gw.reinit(self)
    }
}

impl std::fmt::Display for InputNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_matches_form() {
        let input = InputNum::new(3, 2, 10, 1).unwrap();
        assert_eq!(input.value(), 3 * 1024 + 1);
        let input = InputNum::new(1, 2, 31, -1).unwrap();
        assert_eq!(input.value(), Integer::from(2147483647u32)); // 2^31 - 1
    }

    #[test]
    fn display_omits_unit_k() {
        assert_eq!(InputNum::new(1, 2, 61, -1).unwrap().display_text(), "2^61-1");
        assert_eq!(
            InputNum::new(3, 2, 50000, 1).unwrap().display_text(),
            "3*2^50000+1"
        );
        assert_eq!(
            InputNum::new(5, 3, 100, 7).unwrap().display_text(),
            "5*3^100+7"
        );
    }

    #[test]
    fn parse_roundtrips_display() {
        for expr in ["3*2^50000+1", "2^61-1", "5*3^100+7", "7*10^20-3"] {
            let input = InputNum::parse(expr).unwrap();
            assert_eq!(input.display_text(), expr);
        }
    }

    #[test]
    fn parse_tolerates_whitespace() {
        let input = InputNum::parse("3 * 2^31 + 1").unwrap();
        assert_eq!(input.k(), 3);
        assert_eq!(input.b(), 2);
        assert_eq!(input.n(), 31);
        assert_eq!(input.c(), 1);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(InputNum::parse("hello").is_err());
        assert!(InputNum::parse("3*2+1").is_err());
        assert!(InputNum::parse("3*2^").is_err());
        assert!(InputNum::parse("2^10").is_err());
    }

    #[test]
    fn rejects_degenerate_forms() {
        assert!(InputNum::new(0, 2, 10, 1).is_err());
        assert!(InputNum::new(1, 1, 10, 1).is_err());
        assert!(InputNum::new(1, 2, 0, 1).is_err());
        // 1*2^1 - 2 = 0
        assert!(InputNum::new(1, 2, 1, -2).is_err());
    }

    #[test]
    fn bitlen_of_mersenne() {
        assert_eq!(InputNum::new(1, 2, 61, -1).unwrap().bitlen(), 61);
        assert_eq!(InputNum::new(1, 2, 61, 1).unwrap().bitlen(), 62);
    }
}

//! Modular arithmetic backends for the exponentiation drivers.
//!
//! The drivers only see the [`FftArith`] contract: squarings and
//! multiplications in ℤ/Nℤ with FFT pipelining hints, a careful mode with
//! conservative numerics, roundoff detection, and explicit conversions to
//! and from the portable big-integer form used for persistence.
//!
//! Two implementations:
//!
//! - [`SoftFft`] — portable arithmetic on `rug::Integer`. Always available,
//!   bit-exact, and the only backend the test suite needs. It also serves
//!   as the fault-injection harness: [`SoftFft::schedule_fault`] flips one
//!   bit of a chosen multiplication's output so the error-detection path
//!   can be exercised deterministically.
//! - [`GwFft`] — the GWNUM IBDWT backend (feature `gwnum`), 50-100x faster
//!   on large k*b^n+c moduli. x86-64 only.
//!
//! # Thread Safety
//!
//! Backends are `!Sync`; a backend handle is exclusively borrowed by one
//! driver for the duration of a run.

use rug::ops::RemRounding;
use rug::Integer;

use crate::input::InputNum;

/// Errors from backend arithmetic.
#[derive(Debug, Clone)]
pub enum GwError {
    /// gwsetup failed (invalid parameters or unsupported configuration).
    SetupFailed { code: i32 },
    /// Roundoff error detected after an FFT arithmetic operation.
    RoundoffError,
    /// Hardware error detected (e.g., memory corruption, CPU fault).
    HardwareError,
    /// Internal GWNUM error (unexpected error code from library).
    InternalError { code: i32 },
    /// GWNUM library not available (gwnum.a not linked).
    Unavailable,
}

impl std::fmt::Display for GwError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GwError::SetupFailed { code } => write!(f, "gwsetup failed with code {}", code),
            GwError::RoundoffError => write!(f, "roundoff error detected"),
            GwError::HardwareError => write!(f, "hardware error detected"),
            GwError::InternalError { code } => write!(f, "internal backend error (code {})", code),
            GwError::Unavailable => write!(f, "GWNUM library not available"),
        }
    }
}

impl std::error::Error for GwError {}

impl GwError {
    /// Whether the error policy is "rebuild the backend and resume from the
    /// last committed state" rather than fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GwError::RoundoffError | GwError::HardwareError | GwError::InternalError { .. }
        )
    }
}

/// Source 1 is already FFTed (or should be left FFTed).
pub const FFT_S1: u32 = 1;
/// Source 2 is already FFTed (or should be left FFTed).
pub const FFT_S2: u32 = 2;
/// Leave the result partially FFTed, pipelining into the next operation.
pub const STARTNEXTFFT: u32 = 4;
/// Also multiply the result by the constant set with `set_mulbyconst`.
pub const MULBYCONST: u32 = 8;
/// Run this operation with conservative numerics (no pipelining).
pub const CAREFUL: u32 = 16;

/// `STARTNEXTFFT` when the next operation is known to follow, 0 otherwise.
#[inline]
pub fn startnextfft_if(cond: bool) -> u32 {
    if cond {
        STARTNEXTFFT
    } else {
        0
    }
}

/// Contract between the exponentiation drivers and the FFT multiplier.
///
/// All mutating arithmetic reports roundoff immediately; the driver decides
/// whether that is recoverable. Residues (`Num`) belong to the backend that
/// allocated them and must not outlive it.
pub trait FftArith {
    type Num;

    fn alloc(&mut self) -> Self::Num;
    fn copy(&mut self, src: &Self::Num, dst: &mut Self::Num);
    fn set_small(&mut self, g: &mut Self::Num, val: u32);

    /// dst = src² mod N.
    fn square(&mut self, src: &Self::Num, dst: &mut Self::Num, flags: u32)
        -> Result<(), GwError>;
    /// g = g² mod N.
    fn square_inplace(&mut self, g: &mut Self::Num, flags: u32) -> Result<(), GwError>;
    /// dst = a·b mod N (dst distinct from both sources).
    fn mul3(
        &mut self,
        a: &Self::Num,
        b: &Self::Num,
        dst: &mut Self::Num,
        flags: u32,
    ) -> Result<(), GwError>;
    /// dst = a·dst mod N.
    fn mul_into(&mut self, a: &Self::Num, dst: &mut Self::Num, flags: u32)
        -> Result<(), GwError>;
    /// dst = dst − b mod N.
    fn sub_into(&mut self, dst: &mut Self::Num, b: &Self::Num);

    fn is_zero(&mut self, g: &Self::Num) -> bool;
    fn from_integer(&mut self, v: &Integer) -> Self::Num;
    fn to_integer(&mut self, g: &Self::Num) -> Integer;

    /// Set the constant applied by [`MULBYCONST`]. Must be ≤ `max_mulbyconst`.
    fn set_mulbyconst(&mut self, c: u32);
    fn max_mulbyconst(&self) -> u32;

    /// Run the next n multiplications with conservative numerics.
    fn carefully_count(&mut self, n: u32);

    /// Explicit roundoff validation point (reads and clears the error state).
    fn check_roundoff(&mut self) -> Result<(), GwError>;

    /// Whether the chosen FFT length is near its safe exponent limit.
    fn near_fft_limit(&mut self) -> bool;

    /// Transforms performed so far (two per multiplication). Preserved
    /// across `reinit`.
    fn fft_count(&self) -> u64;
    fn fft_description(&mut self) -> String;
    fn fft_length(&mut self) -> u64;

    /// Tear down and rebuild the multiplier around the input number,
    /// preserving the running transform count.
    fn reinit(&mut self, input: &InputNum) -> Result<(), GwError>;
}

/// Portable software backend: plain `rug::Integer` arithmetic reduced
/// mod N after every operation. Bit-exact reference for the GWNUM backend
/// and the arithmetic used by the whole test suite.
pub struct SoftFft {
    modulus: Integer,
    display: String,
    mulbyconst: u32,
    max_mulbyconst: u32,
    careful_left: u32,
    muls: u64,
    near_limit: bool,
    fault_at: Option<u64>,
    roundoff_at: Option<u64>,
}

impl SoftFft {
    /// Largest constant accepted by `set_mulbyconst`, mirroring the small
    /// range GWNUM can fold into the normalization pass.
    pub const MAX_MULBYCONST: u32 = 65535;

    pub fn new(input: &InputNum) -> Self {
        SoftFft {
            modulus: input.value(),
            display: input.display_text(),
            mulbyconst: 1,
            max_mulbyconst: Self::MAX_MULBYCONST,
            careful_left: 0,
            muls: 0,
            near_limit: false,
            fault_at: None,
            roundoff_at: None,
        }
    }

    /// Flip one bit of the `at_op`-th multiplication's output (1-based,
    /// counted from now). Fires once. Test harness hook for exercising the
    /// Gerbicz failure path.
    pub fn schedule_fault(&mut self, ops_from_now: u64) {
        self.fault_at = Some(self.muls + ops_from_now);
    }

    /// Report a roundoff error from the `at_op`-th multiplication (1-based,
    /// counted from now). Fires once. Exercises the rebuild-and-resume path.
    pub fn schedule_roundoff(&mut self, ops_from_now: u64) {
        self.roundoff_at = Some(self.muls + ops_from_now);
    }

    /// Pretend the FFT length is (or is not) near its safe limit.
    pub fn set_near_fft_limit(&mut self, near: bool) {
        self.near_limit = near;
    }

    /// Multiplications issued so far.
    pub fn muls(&self) -> u64 {
        self.muls
    }

    fn finish_op(&mut self, dst: &mut Integer) -> Result<(), GwError> {
        self.muls += 1;
        if self.careful_left > 0 {
            self.careful_left -= 1;
        }
        if self.fault_at == Some(self.muls) {
            self.fault_at = None;
            // One-bit soft error, as a cosmic ray would deliver it.
            *dst ^= Integer::from(1u32) << 7u32;
            *dst = dst.clone().rem_euc(&self.modulus);
        }
        if self.roundoff_at == Some(self.muls) {
            self.roundoff_at = None;
            return Err(GwError::RoundoffError);
        }
        Ok(())
    }

    fn apply_const(&self, v: &mut Integer, flags: u32) {
        if flags & MULBYCONST != 0 {
            *v *= self.mulbyconst;
        }
    }
}

impl FftArith for SoftFft {
    type Num = Integer;

    fn alloc(&mut self) -> Integer {
        Integer::new()
    }

    fn copy(&mut self, src: &Integer, dst: &mut Integer) {
        *dst = src.clone();
    }

    fn set_small(&mut self, g: &mut Integer, val: u32) {
        *g = Integer::from(val).rem_euc(&self.modulus);
    }

    fn square(&mut self, src: &Integer, dst: &mut Integer, flags: u32) -> Result<(), GwError> {
        let mut v = Integer::from(src * src);
        self.apply_const(&mut v, flags);
        *dst = v.rem_euc(&self.modulus);
        self.finish_op(dst)
    }

    fn square_inplace(&mut self, g: &mut Integer, flags: u32) -> Result<(), GwError> {
        let mut v = Integer::from(&*g * &*g);
        self.apply_const(&mut v, flags);
        *g = v.rem_euc(&self.modulus);
        self.finish_op(g)
    }

    fn mul3(
        &mut self,
        a: &Integer,
        b: &Integer,
        dst: &mut Integer,
        flags: u32,
    ) -> Result<(), GwError> {
        let mut v = Integer::from(a * b);
        self.apply_const(&mut v, flags);
        *dst = v.rem_euc(&self.modulus);
        self.finish_op(dst)
    }

    fn mul_into(&mut self, a: &Integer, dst: &mut Integer, flags: u32) -> Result<(), GwError> {
        let mut v = Integer::from(a * &*dst);
        self.apply_const(&mut v, flags);
        *dst = v.rem_euc(&self.modulus);
        self.finish_op(dst)
    }

    fn sub_into(&mut self, dst: &mut Integer, b: &Integer) {
        *dst -= b;
        *dst = dst.clone().rem_euc(&self.modulus);
    }

    fn is_zero(&mut self, g: &Integer) -> bool {
        g.is_zero()
    }

    fn from_integer(&mut self, v: &Integer) -> Integer {
        v.clone().rem_euc(&self.modulus)
    }

    fn to_integer(&mut self, g: &Integer) -> Integer {
        g.clone()
    }

    fn set_mulbyconst(&mut self, c: u32) {
        debug_assert!(c <= self.max_mulbyconst);
        self.mulbyconst = c;
    }

    fn max_mulbyconst(&self) -> u32 {
        self.max_mulbyconst
    }

    fn carefully_count(&mut self, n: u32) {
        self.careful_left = self.careful_left.max(n);
    }

    fn check_roundoff(&mut self) -> Result<(), GwError> {
        // Software arithmetic is exact; scheduled roundoff surfaces from the
        // operation itself, read-and-clear style.
        Ok(())
    }

    fn near_fft_limit(&mut self) -> bool {
        self.near_limit
    }

    fn fft_count(&self) -> u64 {
        self.muls * 2
    }

    fn fft_description(&mut self) -> String {
        format!(
            "software (rug) arithmetic mod {}, {} bits",
            self.display,
            self.modulus.significant_bits()
        )
    }

    fn fft_length(&mut self) -> u64 {
        u64::from(self.modulus.significant_bits()).next_power_of_two()
    }

    fn reinit(&mut self, input: &InputNum) -> Result<(), GwError> {
        // Transform count and scheduled faults survive a rebuild.
        self.modulus = input.value();
        self.display = input.display_text();
        self.careful_left = 0;
        Ok(())
    }
}

/// GWNUM-backed arithmetic (feature `gwnum`). RAII wrapper over a
/// `gwhandle`; x86-64 only, `!Send`/`!Sync`, one handle per thread.
#[cfg(feature = "gwnum")]
pub struct GwFft {
    handle: Box<gwnum_sys::gwhandle>,
    max_mulbyconst: u32,
    muls: u64,
    _not_send: std::marker::PhantomData<*mut ()>,
}

/// RAII wrapper for a gwnum value. Freed when dropped.
#[cfg(feature = "gwnum")]
pub struct GwResidue {
    inner: gwnum_sys::gwnum,
    ctx: *mut gwnum_sys::gwhandle,
    _not_send: std::marker::PhantomData<*mut ()>,
}

#[cfg(feature = "gwnum")]
impl Drop for GwResidue {
    fn drop(&mut self) {
        unsafe {
            gwnum_sys::gwfree(self.ctx, self.inner);
        }
    }
}

#[cfg(feature = "gwnum")]
impl GwFft {
    const GWNUM_VERSION: &'static str = "30.19";

    pub fn new(input: &InputNum) -> Result<Self, GwError> {
        let mut gw = GwFft {
            handle: Box::new(unsafe {
                std::mem::MaybeUninit::<gwnum_sys::gwhandle>::zeroed().assume_init()
            }),
            max_mulbyconst: SoftFft::MAX_MULBYCONST,
            muls: 0,
            _not_send: std::marker::PhantomData,
        };
        gw.setup(input)?;
        Ok(gw)
    }

    fn setup(&mut self, input: &InputNum) -> Result<(), GwError> {
        use std::ffi::CString;

        let version = CString::new(Self::GWNUM_VERSION).unwrap();
        unsafe {
            gwnum_sys::gwinit2(
                &mut *self.handle,
                std::mem::size_of::<gwnum_sys::gwhandle>() as i32,
                version.as_ptr(),
            );
            gwnum_sys::gwset_maxmulbyconst(&mut *self.handle, self.max_mulbyconst as i64);
        }
        let ret = unsafe {
            gwnum_sys::gwsetup(
                &mut *self.handle,
                input.k() as f64,
                input.b() as u64,
                input.n(),
                input.c(),
            )
        };
        if ret != 0 {
            unsafe { gwnum_sys::gwdone(&mut *self.handle) };
            return Err(GwError::SetupFailed { code: ret });
        }
        Ok(())
    }

    fn op_flags(&mut self, flags: u32) -> i32 {
        if flags & CAREFUL != 0 {
            unsafe { gwnum_sys::gwset_carefully_count(&mut *self.handle, 1) };
        }
        // Engine flag values match the sys constants bit for bit.
        (flags & (FFT_S1 | FFT_S2 | STARTNEXTFFT | MULBYCONST)) as i32
    }

    fn check_error(&mut self) -> Result<(), GwError> {
        let err = unsafe { gwnum_sys::gw_check_error(&mut *self.handle) };
        match err {
            gwnum_sys::GWERROR_NONE => Ok(()),
            gwnum_sys::GWERROR_ROUNDOFF => Err(GwError::RoundoffError),
            gwnum_sys::GWERROR_HARDWARE => Err(GwError::HardwareError),
            _ => Err(GwError::InternalError { code: err }),
        }
    }
}

#[cfg(feature = "gwnum")]
impl Drop for GwFft {
    fn drop(&mut self) {
        unsafe {
            gwnum_sys::gwfreeall(&mut *self.handle);
            gwnum_sys::gwdone(&mut *self.handle);
        }
    }
}

#[cfg(feature = "gwnum")]
impl FftArith for GwFft {
    type Num = GwResidue;

    fn alloc(&mut self) -> GwResidue {
        let inner = unsafe { gwnum_sys::gwalloc(&mut *self.handle) };
        GwResidue {
            inner,
            ctx: &mut *self.handle,
            _not_send: std::marker::PhantomData,
        }
    }

    fn copy(&mut self, src: &GwResidue, dst: &mut GwResidue) {
        // gwcopy is a macro in the C API; a multiply by one would churn the
        // FFT, so round-trip through the binary form instead.
        let v = self.to_integer(src);
        let fresh = self.from_integer(&v);
        unsafe {
            gwnum_sys::gwfree(&mut *self.handle, dst.inner);
        }
        dst.inner = fresh.inner;
        std::mem::forget(fresh);
    }

    fn set_small(&mut self, g: &mut GwResidue, val: u32) {
        unsafe {
            gwnum_sys::dbltogw(&mut *self.handle, val as f64, g.inner);
        }
    }

    fn square(&mut self, src: &GwResidue, dst: &mut GwResidue, flags: u32) -> Result<(), GwError> {
        let opts = self.op_flags(flags);
        unsafe {
            gwnum_sys::gwmul3(&mut *self.handle, src.inner, src.inner, dst.inner, opts);
        }
        self.muls += 1;
        self.check_error()
    }

    fn square_inplace(&mut self, g: &mut GwResidue, flags: u32) -> Result<(), GwError> {
        let opts = self.op_flags(flags);
        unsafe {
            gwnum_sys::gwmul3(&mut *self.handle, g.inner, g.inner, g.inner, opts);
        }
        self.muls += 1;
        self.check_error()
    }

    fn mul3(
        &mut self,
        a: &GwResidue,
        b: &GwResidue,
        dst: &mut GwResidue,
        flags: u32,
    ) -> Result<(), GwError> {
        let opts = self.op_flags(flags);
        unsafe {
            gwnum_sys::gwmul3(&mut *self.handle, a.inner, b.inner, dst.inner, opts);
        }
        self.muls += 1;
        self.check_error()
    }

    fn mul_into(&mut self, a: &GwResidue, dst: &mut GwResidue, flags: u32) -> Result<(), GwError> {
        let opts = self.op_flags(flags);
        unsafe {
            gwnum_sys::gwmul3(&mut *self.handle, a.inner, dst.inner, dst.inner, opts);
        }
        self.muls += 1;
        self.check_error()
    }

    fn sub_into(&mut self, dst: &mut GwResidue, b: &GwResidue) {
        unsafe {
            gwnum_sys::gwsub3o(&mut *self.handle, dst.inner, b.inner, dst.inner, 0);
        }
    }

    fn is_zero(&mut self, g: &GwResidue) -> bool {
        self.to_integer(g).is_zero()
    }

    fn from_integer(&mut self, v: &Integer) -> GwResidue {
        let g = self.alloc();
        let limbs = v.to_digits::<u32>(rug::integer::Order::Lsf);
        unsafe {
            gwnum_sys::binarytogw(
                &mut *self.handle,
                limbs.as_ptr(),
                limbs.len() as i32,
                g.inner,
            );
        }
        g
    }

    fn to_integer(&mut self, g: &GwResidue) -> Integer {
        // Enough for multi-million digit numbers.
        let max_words = 1024 * 1024;
        let mut buf: Vec<u32> = vec![0; max_words];
        let len = unsafe {
            gwnum_sys::gwtobinary(&mut *self.handle, g.inner, buf.as_mut_ptr(), max_words as i32)
        };
        buf.truncate(len as usize);
        Integer::from_digits(&buf, rug::integer::Order::Lsf)
    }

    fn set_mulbyconst(&mut self, c: u32) {
        unsafe {
            gwnum_sys::gwsetmulbyconst(&mut *self.handle, c as i64);
        }
    }

    fn max_mulbyconst(&self) -> u32 {
        self.max_mulbyconst
    }

    fn carefully_count(&mut self, n: u32) {
        unsafe {
            gwnum_sys::gwset_carefully_count(&mut *self.handle, n as i32);
        }
    }

    fn check_roundoff(&mut self) -> Result<(), GwError> {
        self.check_error()
    }

    fn near_fft_limit(&mut self) -> bool {
        unsafe { gwnum_sys::gwnear_fft_limit(&mut *self.handle, 1.0) != 0 }
    }

    fn fft_count(&self) -> u64 {
        self.muls * 2
    }

    fn fft_description(&mut self) -> String {
        let mut buf = [0 as std::os::raw::c_char; 200];
        unsafe {
            gwnum_sys::gwfft_description(&mut *self.handle, buf.as_mut_ptr());
            std::ffi::CStr::from_ptr(buf.as_ptr())
                .to_string_lossy()
                .into_owned()
        }
    }

    fn fft_length(&mut self) -> u64 {
        unsafe { gwnum_sys::gwfftlen(&mut *self.handle) }
    }

    fn reinit(&mut self, input: &InputNum) -> Result<(), GwError> {
        unsafe {
            gwnum_sys::gwfreeall(&mut *self.handle);
            gwnum_sys::gwdone(&mut *self.handle);
        }
        self.setup(input)
    }
}

//! Shared driver lifecycle: timing, transform accounting, error-check
//! arming, commit/write gating, restart policy.
//!
//! Every exponentiation driver embeds a [`TaskCore`] and drives it the
//! same way: `begin` when `run` starts, `check`/`should_commit` at
//! iteration boundaries, `reinit` after a transient arithmetic error,
//! `done` on completion. Restart flow is a plain result discriminant
//! ([`Outcome`]) handed up one frame, not unwinding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arith::{FftArith, GwError};
use crate::input::InputNum;
use crate::progress::Reporter;

/// Multiplications between in-memory state commits, before the per-driver
/// weighting (1/1.5 for SlowExp, 1/log2(b) for the Gerbicz driver).
pub const MULS_PER_STATE_UPDATE: u64 = 40_000;

/// Gerbicz verifications per checkpoint interval used by automatic
/// parameter selection.
pub const CHECKS_PER_POINT: u64 = 1;

/// Driver configuration. The defaults match production use; tests shrink
/// the periods to exercise the commit machinery.
#[derive(Clone)]
pub struct ExpConfig {
    /// Base state-commit period, in multiplications.
    pub muls_per_state_update: u64,
    /// Gerbicz verifications per checkpoint interval (auto parameters).
    pub checks_per_point: u64,
    /// Always run roundoff checks, regardless of FFT headroom.
    pub error_check_forced: bool,
    /// Arm roundoff checks when the FFT length is near its safe limit.
    pub error_check_near: bool,
    /// Transient-error / Gerbicz-failure restarts allowed before giving up.
    pub max_restarts: u32,
    /// Minimum spacing of periodic state-file writes. Checkpoint and
    /// recovery writes ignore this.
    pub write_interval: Duration,
    /// Cooperative stop flag, polled at commit points only.
    pub stop: Option<Arc<AtomicBool>>,
}

impl Default for ExpConfig {
    fn default() -> Self {
        ExpConfig {
            muls_per_state_update: MULS_PER_STATE_UPDATE,
            checks_per_point: CHECKS_PER_POINT,
            error_check_forced: false,
            error_check_near: true,
            max_restarts: 3,
            write_interval: Duration::from_secs(60),
            stop: None,
        }
    }
}

impl ExpConfig {
    /// SlowExp costs ~1.5 transforms per iteration (extra mul per 1-bit).
    pub fn period_slow(&self) -> u64 {
        ((self.muls_per_state_update as f64) / 1.5).max(1.0) as u64
    }

    /// Denser commits when each iteration is log2(b) squarings worth of work.
    pub fn period_for_base(&self, b: u32) -> u64 {
        ((self.muls_per_state_update as f64) / (b as f64).log2()).max(1.0) as u64
    }
}

/// What a single `execute` pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Ran to the final iteration.
    Done,
    /// Discard the block and re-enter from the recovery state.
    RestartFromRecovery,
    /// Cooperative stop honoured at a commit point.
    Interrupted,
}

/// Fatal and recoverable driver errors.
#[derive(Debug)]
pub enum ExpError {
    /// Invalid construction parameters (bad checkpoints, oversized x0, ...).
    Config(String),
    /// Backend arithmetic failed unrecoverably.
    Arithmetic(GwError),
    /// Too many restarts; the last provably-correct iteration is reported.
    RestartBudgetExceeded {
        restarts: u32,
        recovery_iteration: u64,
    },
    /// Stop flag honoured; the committed state holds `iteration`.
    Interrupted { iteration: u64 },
    /// State file I/O failed.
    Persist(String),
}

impl std::fmt::Display for ExpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpError::Config(msg) => write!(f, "configuration error: {}", msg),
            ExpError::Arithmetic(e) => write!(f, "arithmetic error: {}", e),
            ExpError::RestartBudgetExceeded {
                restarts,
                recovery_iteration,
            } => write!(
                f,
                "gave up after {} restarts; last verified iteration {}",
                restarts, recovery_iteration
            ),
            ExpError::Interrupted { iteration } => {
                write!(f, "interrupted at iteration {}", iteration)
            }
            ExpError::Persist(msg) => write!(f, "state persistence failed: {}", msg),
        }
    }
}

impl std::error::Error for ExpError {}

impl From<GwError> for ExpError {
    fn from(e: GwError) -> Self {
        ExpError::Arithmetic(e)
    }
}

/// Timer, transform counter, error-check arming and restart accounting.
pub struct TaskCore {
    config: ExpConfig,
    iterations: u64,
    state_update_period: u64,
    started: Option<Instant>,
    elapsed: Duration,
    transforms_base: u64,
    error_check: bool,
    restart_count: u32,
    last_write: Instant,
}

impl TaskCore {
    pub fn new(config: ExpConfig) -> Self {
        TaskCore {
            config,
            iterations: 0,
            state_update_period: MULS_PER_STATE_UPDATE,
            started: None,
            elapsed: Duration::ZERO,
            transforms_base: 0,
            error_check: false,
            restart_count: 0,
            last_write: Instant::now(),
        }
    }

    pub fn config(&self) -> &ExpConfig {
        &self.config
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn error_check(&self) -> bool {
        self.error_check
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Start the clock, pin the transform baseline, arm roundoff checking.
    pub fn begin<B: FftArith>(
        &mut self,
        gw: &mut B,
        iterations: u64,
        state_update_period: u64,
    ) {
        self.iterations = iterations;
        self.state_update_period = state_update_period.max(1);
        self.started = Some(Instant::now());
        self.transforms_base = gw.fft_count();
        self.arm_error_check(gw);
        self.last_write = Instant::now();
    }

    fn arm_error_check<B: FftArith>(&mut self, gw: &mut B) {
        self.error_check = if self.config.error_check_near {
            gw.near_fft_limit() || self.config.error_check_forced
        } else {
            self.config.error_check_forced
        };
    }

    /// Roundoff validation point; a no-op unless checking is armed.
    pub fn check<B: FftArith>(&mut self, gw: &mut B) -> Result<(), GwError> {
        if self.error_check {
            gw.check_roundoff()
        } else {
            Ok(())
        }
    }

    /// Whether iteration i is a state-commit boundary.
    pub fn should_commit(&self, i: u64) -> bool {
        i == self.iterations || i % self.state_update_period == 0
    }

    /// Commit boundary test for loops advancing `step` iterations at a time:
    /// true when the step crossed a period boundary.
    pub fn should_commit_step(&self, i: u64, step: u64) -> bool {
        i == self.iterations
            || i / self.state_update_period != i.saturating_sub(step) / self.state_update_period
    }

    /// Whether enough wall time has passed for a periodic file write.
    pub fn should_write(&self) -> bool {
        self.last_write.elapsed() >= self.config.write_interval
    }

    pub fn mark_written(&mut self) {
        self.last_write = Instant::now();
    }

    pub fn stop_requested(&self) -> bool {
        self.config
            .stop
            .as_ref()
            .is_some_and(|s| s.load(Ordering::Relaxed))
    }

    /// Transforms performed since `begin`.
    pub fn transforms<B: FftArith>(&self, gw: &B) -> u64 {
        gw.fft_count().saturating_sub(self.transforms_base)
    }

    /// Feed the progress channel.
    pub fn progress<B: FftArith>(&self, gw: &B, reporter: &Reporter, i: u64) {
        let frac = if self.iterations == 0 {
            1.0
        } else {
            i as f64 / self.iterations as f64
        };
        reporter.update(frac, self.transforms(gw));
    }

    /// Account a restart against the budget.
    pub fn register_restart(&mut self, recovery_iteration: u64) -> Result<(), ExpError> {
        self.restart_count += 1;
        if self.restart_count > self.config.max_restarts {
            return Err(ExpError::RestartBudgetExceeded {
                restarts: self.restart_count,
                recovery_iteration,
            });
        }
        Ok(())
    }

    /// A verified block clears the restart counter.
    pub fn reset_restarts(&mut self) {
        self.restart_count = 0;
    }

    /// Tear down and rebuild the FFT backend around the input number,
    /// preserving the transform count, then log the restart notice.
    pub fn reinit<B: FftArith>(
        &mut self,
        gw: &mut B,
        input: &InputNum,
        reporter: &Reporter,
    ) -> Result<(), GwError> {
        gw.reinit(input)?;
        let prefix = reporter.prefix();
        reporter.set_prefix("");
        reporter.error(&format!("Restarting using {}", gw.fft_description()));
        reporter.set_prefix(&prefix);
        reporter.report_param("fft_desc", gw.fft_description());
        reporter.report_param("fft_len", gw.fft_length());
        self.arm_error_check(gw);
        Ok(())
    }

    /// Final accounting: elapsed time and transform total to the sink.
    pub fn done<B: FftArith>(&mut self, gw: &B, reporter: &Reporter) {
        if let Some(started) = self.started.take() {
            self.elapsed = started.elapsed();
        }
        let transforms = self.transforms(gw);
        reporter.update(1.0, transforms);
        reporter.info(&format!(
            "done in {:.3}s, {} transforms",
            self.elapsed.as_secs_f64(),
            transforms
        ));
        reporter.set_prefix("");
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

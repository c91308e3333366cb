//! Gerbicz-checked multipoint exponentiation.
//!
//! Layers a rolling redundancy check over the multipoint driver: within a
//! block of L2 = q·L iterations the accumulator D collects the residue
//! every L steps, and at the block end the identity
//! X_L2·D ≡ R·D^(b^L) (mod N) is verified with careful arithmetic. A
//! mismatch discards the block and restarts from R, the last verified
//! residue, so silent FFT errors cost at most one block.
//!
//! Two files persist across a crash: the working file (current X and D,
//! written on the commit cadence) and the recovery file (R, rewritten only
//! after a block verifies).

use rug::ops::Pow;
use rug::Integer;
use std::sync::Arc;

use crate::arith::{startnextfft_if, FftArith, CAREFUL, FFT_S1};
use crate::checked_u32;
use crate::input::InputNum;
use crate::multipoint::{select_window, sliding_window, window_cost};
use crate::progress::Reporter;
use crate::state::{GerbiczCheckState, State, StateFile, StateRecord};
use crate::task::{ExpConfig, ExpError, Outcome, TaskCore};

/// Choose the check block shape (L, L2) for a given iteration count:
/// L ≈ √iters, then L2 = iters − iters mod L maximised over L² < 2·iters.
/// The base factor is intentionally ignored (L is picked in iteration
/// units, not squaring units).
pub fn gerbicz_params(iters: u64) -> (u64, u64) {
    let mut l = ((iters as f64).sqrt() as u64).max(1);
    let mut l2 = iters - iters % l;
    let mut i = l + 1;
    while i * i < 2 * iters {
        if l2 < iters - iters % i {
            l = i;
            l2 = iters - iters % i;
        }
        i += 1;
    }
    (l, l2)
}

/// Working position: either a bare marker at a verified block boundary
/// (X and D live in the recovery state) or a full mid-block commit.
enum Working {
    Marker(u64),
    Full(GerbiczCheckState),
}

impl Working {
    fn iteration(&self) -> u64 {
        match self {
            Working::Marker(i) => *i,
            Working::Full(s) => s.iteration(),
        }
    }
}

pub struct GerbiczCheckExp {
    input: InputNum,
    b: u32,
    points: Vec<u64>,
    l: u64,
    l2: u64,
    max_w: Option<u32>,
    max_table: Option<u64>,
    file: StateFile,
    file_recovery: StateFile,
    state_recovery: State,
    recovery_written_at: Option<u64>,
    working: Working,
    on_point: Option<Box<dyn FnMut(u64)>>,
    reporter: Arc<Reporter>,
    core: TaskCore,
}

impl GerbiczCheckExp {
    /// Construct with automatically chosen (L, L2); with
    /// `checks_per_point` > 1 the block is sized so that many
    /// verifications fit in one checkpoint interval.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: InputNum,
        b: u32,
        points: Vec<u64>,
        base: Integer,
        file: StateFile,
        file_recovery: StateFile,
        reporter: Arc<Reporter>,
        config: ExpConfig,
    ) -> Result<Self, ExpError> {
        let iters = points.last().copied().unwrap_or(0);
        let (l, l2) = gerbicz_params((iters / config.checks_per_point.max(1)).max(1));
        Self::with_params(
            input,
            b,
            points,
            base,
            l,
            l2,
            file,
            file_recovery,
            reporter,
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_params(
        input: InputNum,
        b: u32,
        points: Vec<u64>,
        base: Integer,
        l: u64,
        l2: u64,
        file: StateFile,
        file_recovery: StateFile,
        reporter: Arc<Reporter>,
        config: ExpConfig,
    ) -> Result<Self, ExpError> {
        if b < 2 {
            return Err(ExpError::Config("base b must be at least 2".into()));
        }
        if points.is_empty() {
            return Err(ExpError::Config("checkpoint list must not be empty".into()));
        }
        if points[0] == 0 || points.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ExpError::Config(
                "checkpoints must be strictly increasing and positive".into(),
            ));
        }
        if l == 0 || l2 < l || l2 % l != 0 {
            return Err(ExpError::Config(format!(
                "invalid check block: L = {}, L2 = {}",
                l, l2
            )));
        }
        let core = TaskCore::new(config);
        let mut driver = GerbiczCheckExp {
            input,
            b,
            points,
            l,
            l2,
            max_w: None,
            max_table: None,
            file,
            file_recovery,
            state_recovery: State::new(0, base),
            recovery_written_at: None,
            working: Working::Marker(0),
            on_point: None,
            reporter,
            core,
        };
        driver.load_states();
        Ok(driver)
    }

    fn load_states(&mut self) {
        if let Some(recovery) = self
            .file_recovery
            .read()
            .as_ref()
            .and_then(State::from_record)
        {
            if recovery.iteration() <= self.iterations() {
                self.recovery_written_at = Some(recovery.iteration());
                self.state_recovery = recovery;
            }
        }
        let start = self.state_recovery.iteration();
        self.working = Working::Marker(start);
        if let Some(record) = self.file.read() {
            let working = match &record {
                StateRecord::Marker { iteration } => Some(Working::Marker(*iteration)),
                _ => GerbiczCheckState::from_record(&record).map(Working::Full),
            };
            if let Some(working) = working {
                let i = working.iteration();
                let aligned = self.b == 2 || (i - start) % self.l == 0;
                if i >= start && i < start + self.l2 && aligned {
                    self.working = working;
                }
            }
        }
    }

    pub fn set_max_window(&mut self, max_w: Option<u32>) {
        self.max_w = max_w;
    }

    pub fn set_max_table(&mut self, max_table: Option<u64>) {
        self.max_table = max_table;
    }

    /// Callback invoked once per reached checkpoint, after the commit.
    pub fn on_point(&mut self, callback: impl FnMut(u64) + 'static) {
        self.on_point = Some(Box::new(callback));
    }

    pub fn iterations(&self) -> u64 {
        *self.points.last().expect("validated non-empty")
    }

    pub fn block_params(&self) -> (u64, u64) {
        (self.l, self.l2)
    }

    /// Last verified state; the restart target on any error.
    pub fn recovery_state(&self) -> &State {
        &self.state_recovery
    }

    /// Predicted multiplication count including the check overhead:
    /// the D folds every L iterations plus an L-long verification
    /// exponentiation per L2 block.
    pub fn cost(&self) -> f64 {
        let n = self.iterations() as f64;
        let l = self.l as f64;
        let l2 = self.l2 as f64;
        if self.b == 2 {
            n + n / l + n / l2 * l
        } else {
            let log2b = f64::from(self.b).log2();
            let len = (log2b * l) as u64;
            let w = select_window(len, self.max_w, self.max_table);
            n / l + (n / l + n / l2) * window_cost(w, len)
        }
    }

    pub fn run<B: FftArith>(&mut self, gw: &mut B) -> Result<Integer, ExpError> {
        self.reporter
            .set_prefix(&format!("{} ", self.input.display_text()));
        let period = self.core.config().period_for_base(self.b);
        self.core.begin(gw, self.iterations(), period);
        self.reporter.info(&format!(
            "Gerbicz check enabled, L2 = {}*{}.",
            self.l,
            self.l2 / self.l
        ));
        if self.core.error_check() {
            self.reporter.info("max roundoff check enabled.");
        }
        let position = self.working.iteration();
        if position > 0 {
            self.reporter.info(&format!(
                "restarting at {:.1}%.",
                100.0 * position as f64 / self.iterations() as f64
            ));
        }

        loop {
            match self.execute(gw) {
                Ok(Outcome::Done) => {
                    self.core.done(gw, &self.reporter);
                    return Ok(self.state_recovery.residue().clone());
                }
                Ok(Outcome::RestartFromRecovery) => {
                    let recovery = self.state_recovery.iteration();
                    self.core.register_restart(recovery)?;
                }
                Ok(Outcome::Interrupted) => {
                    return Err(ExpError::Interrupted {
                        iteration: self.working.iteration(),
                    });
                }
                Err(ExpError::Arithmetic(e)) if e.is_transient() => {
                    let recovery = self.state_recovery.iteration();
                    self.core.register_restart(recovery)?;
                    self.core
                        .reinit(gw, &self.input, &self.reporter)
                        .map_err(ExpError::Arithmetic)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn execute<B: FftArith>(&mut self, gw: &mut B) -> Result<Outcome, ExpError> {
        let iterations = self.iterations();
        let mut r = gw.from_integer(self.state_recovery.residue());
        let (mut i, mut x, mut d) = match &self.working {
            Working::Marker(_) => {
                // No mid-block state: start the block with X = D = R.
                let mut x = gw.alloc();
                let mut d = gw.alloc();
                gw.copy(&r, &mut x);
                gw.copy(&r, &mut d);
                (self.state_recovery.iteration(), x, d)
            }
            Working::Full(s) => (
                s.iteration(),
                gw.from_integer(s.residue()),
                gw.from_integer(s.check()),
            ),
        };
        let mut next_point = self
            .points
            .iter()
            .position(|&p| i < p)
            .unwrap_or(self.points.len());
        if i < 30 {
            gw.carefully_count((30 - i) as u32);
        }

        let mut u: Vec<B::Num> = Vec::new();
        let mut last_power: Option<u64> = None;
        let mut seg_exp = Integer::new();

        while next_point < self.points.len() {
            // Keep block boundaries aligned to the next checkpoint.
            let start = self.state_recovery.iteration();
            let mut l = self.l;
            let mut l2 = self.l2;
            while self.points[next_point] - start < l2 && l > 1 {
                l /= 2;
                l2 = l * l;
                last_power = None;
            }
            debug_assert!(i - start <= l2);

            if self.b == 2 {
                let mut j = i - start;
                while j < l2 {
                    let point = self.points.get(next_point).copied().unwrap_or(u64::MAX);
                    gw.square_inplace(
                        &mut x,
                        startnextfft_if(i + 1 != iterations && i + 1 != point && j + 1 != l2),
                    )
                    .map_err(ExpError::from)?;
                    if j + 1 != l2 && i + 1 == point {
                        // Checkpoint crossed mid-block: emit it without
                        // disturbing the accumulator.
                        self.core.check(gw).map_err(ExpError::from)?;
                        self.commit_working(gw, i + 1, &x, &d, true)?;
                        if let Some(callback) = &mut self.on_point {
                            callback(i + 1);
                        }
                        next_point += 1;
                    }
                    if j + 1 != l2 && (j + 1) % l == 0 {
                        gw.mul_into(&x, &mut d, FFT_S1 | startnextfft_if(j + 1 + l != l2))
                            .map_err(ExpError::from)?;
                    }
                    j += 1;
                    i += 1;
                    if self.core.should_commit(i) && j != l2 {
                        self.core.check(gw).map_err(ExpError::from)?;
                        self.commit_working(gw, i, &x, &d, false)?;
                        if self.core.stop_requested() {
                            return Ok(Outcome::Interrupted);
                        }
                    }
                }
            } else {
                debug_assert!((i - start) % l == 0);
                let mut j = i - start;
                while j < l2 {
                    let point = self.points.get(next_point).copied().unwrap_or(u64::MAX);
                    if last_power != Some(l) {
                        last_power = Some(l);
                        seg_exp = Integer::from(self.b).pow(checked_u32(l));
                    }
                    sliding_window(
                        gw,
                        &seg_exp,
                        &mut x,
                        &mut u,
                        false,
                        self.max_w,
                        self.max_table,
                    )
                    .map_err(ExpError::from)?;
                    if j + l != l2 && i + l == point {
                        self.core.check(gw).map_err(ExpError::from)?;
                        self.commit_working(gw, i + l, &x, &d, true)?;
                        if let Some(callback) = &mut self.on_point {
                            callback(i + l);
                        }
                        next_point += 1;
                    }
                    if j + l != l2 {
                        gw.mul_into(&x, &mut d, FFT_S1 | startnextfft_if(j + l + l != l2))
                            .map_err(ExpError::from)?;
                    }
                    j += l;
                    i += l;
                    if self.core.should_commit_step(i, l) && j != l2 {
                        self.core.check(gw).map_err(ExpError::from)?;
                        self.commit_working(gw, i, &x, &d, false)?;
                        if self.core.stop_requested() {
                            return Ok(Outcome::Interrupted);
                        }
                    }
                }
            }
            self.core.check(gw).map_err(ExpError::from)?;

            // Verification, all careful: does X_L2·D equal R·D^(b^L)?
            self.reporter
                .info(&format!("performing Gerbicz check at {}.", i));
            let mut t = gw.alloc();
            gw.copy(&d, &mut t);
            gw.mul_into(&x, &mut d, CAREFUL).map_err(ExpError::from)?;
            std::mem::swap(&mut t, &mut x);
            if self.b == 2 {
                for _ in 0..l {
                    gw.square_inplace(&mut x, CAREFUL).map_err(ExpError::from)?;
                }
            } else {
                if last_power != Some(l) {
                    last_power = Some(l);
                    seg_exp = Integer::from(self.b).pow(checked_u32(l));
                }
                sliding_window(gw, &seg_exp, &mut x, &mut u, true, self.max_w, self.max_table)
                    .map_err(ExpError::from)?;
            }
            gw.mul_into(&r, &mut x, CAREFUL).map_err(ExpError::from)?;
            gw.sub_into(&mut x, &d);
            std::mem::swap(&mut t, &mut x);

            if !gw.is_zero(&t) || gw.is_zero(&d) {
                self.reporter.error(&format!(
                    "Gerbicz check failed at {:.1}%.",
                    100.0 * i as f64 / iterations as f64
                ));
                let recovery = self.state_recovery.iteration();
                self.working = Working::Marker(recovery);
                self.file
                    .write(&StateRecord::Marker {
                        iteration: recovery,
                    })
                    .map_err(|e| ExpError::Persist(e.to_string()))?;
                return Ok(Outcome::RestartFromRecovery);
            }

            // Verified: X becomes the new recovery residue and seeds the
            // next block's accumulator.
            gw.copy(&x, &mut r);
            gw.copy(&x, &mut d);
            self.state_recovery = State::new(i, gw.to_integer(&r));
            self.working = Working::Marker(i);
            self.write_states()?;
            self.core.reset_restarts();
            self.core.progress(gw, &self.reporter, i);

            match self.points.get(next_point) {
                Some(&p) if i == p => {
                    if let Some(callback) = &mut self.on_point {
                        callback(i);
                        self.core.mark_written();
                    }
                    if self.core.stop_requested() {
                        return Ok(Outcome::Interrupted);
                    }
                    next_point += 1;
                }
                Some(_) => continue,
                None => break,
            }
        }

        Ok(Outcome::Done)
    }

    fn commit_working<B: FftArith>(
        &mut self,
        gw: &mut B,
        i: u64,
        x: &B::Num,
        d: &B::Num,
        force_write: bool,
    ) -> Result<(), ExpError> {
        let state = GerbiczCheckState::new(i, gw.to_integer(x), gw.to_integer(d));
        if force_write || self.core.should_write() {
            self.file
                .write(&state.to_record())
                .map_err(|e| ExpError::Persist(e.to_string()))?;
            self.core.mark_written();
        }
        self.core.progress(gw, &self.reporter, i);
        self.working = Working::Full(state);
        Ok(())
    }

    /// Persist a verified block boundary: working marker first, recovery
    /// second, so a crash between the two leaves the recovery file lagging
    /// (a valid restart position).
    fn write_states(&mut self) -> Result<(), ExpError> {
        self.file
            .write(&StateRecord::Marker {
                iteration: self.working.iteration(),
            })
            .map_err(|e| ExpError::Persist(e.to_string()))?;
        if self.recovery_written_at != Some(self.state_recovery.iteration()) {
            self.file_recovery
                .write(&self.state_recovery.to_record())
                .map_err(|e| ExpError::Persist(e.to_string()))?;
            self.recovery_written_at = Some(self.state_recovery.iteration());
        }
        self.core.mark_written();
        Ok(())
    }
}

//! Left-to-right binary exponentiation with an arbitrary base residue.
//!
//! Unlike [`FastExp`](crate::fast_exp::FastExp), the base is a full
//! element of ℤ/Nℤ, so a set bit costs a real multiplication on top of
//! the squaring. The commit period accounts for the extra transforms
//! (roughly 1.5x per iteration).

use rug::Integer;
use std::sync::Arc;

use crate::arith::{startnextfft_if, FftArith};
use crate::checked_u32;
use crate::progress::Reporter;
use crate::state::{State, StateFile};
use crate::task::{ExpConfig, ExpError, Outcome, TaskCore};

pub struct SlowExp {
    input: crate::input::InputNum,
    exp: Integer,
    x0: Integer,
    file: Option<StateFile>,
    state: Option<State>,
    reporter: Arc<Reporter>,
    core: TaskCore,
}

impl SlowExp {
    pub fn new(
        input: crate::input::InputNum,
        exp: Integer,
        x0: Integer,
        file: Option<StateFile>,
        reporter: Arc<Reporter>,
        config: ExpConfig,
    ) -> Result<Self, ExpError> {
        if exp < 1u32 {
            return Err(ExpError::Config("exponent must be at least 1".into()));
        }
        if x0.is_negative() {
            return Err(ExpError::Config("base residue must be non-negative".into()));
        }
        let core = TaskCore::new(config);
        let mut driver = SlowExp {
            input,
            exp,
            x0,
            file,
            state: None,
            reporter,
            core,
        };
        driver.state = driver.load_state();
        Ok(driver)
    }

    fn load_state(&self) -> Option<State> {
        let record = self.file.as_ref()?.read()?;
        let state = State::from_record(&record)?;
        (state.iteration() <= self.iterations()).then_some(state)
    }

    pub fn iterations(&self) -> u64 {
        u64::from(self.exp.significant_bits()) - 1
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Compute X0^E mod N.
    pub fn run<B: FftArith>(&mut self, gw: &mut B) -> Result<Integer, ExpError> {
        self.reporter
            .set_prefix(&format!("{} ", self.input.display_text()));
        let period = self.core.config().period_slow();
        self.core.begin(gw, self.iterations(), period);
        if let Some(state) = &self.state {
            self.reporter.info(&format!(
                "restarting at {:.1}%.",
                100.0 * state.iteration() as f64 / self.iterations().max(1) as f64
            ));
        }

        loop {
            match self.execute(gw) {
                Ok(Outcome::Done) => {
                    self.core.done(gw, &self.reporter);
                    let state = self.state.as_ref().expect("state set on completion");
                    return Ok(state.residue().clone());
                }
                Ok(Outcome::Interrupted) => {
                    let iteration = self.state.as_ref().map_or(0, State::iteration);
                    return Err(ExpError::Interrupted { iteration });
                }
                Ok(Outcome::RestartFromRecovery) => unreachable!("no recovery state here"),
                Err(ExpError::Arithmetic(e)) if e.is_transient() => {
                    let iteration = self.state.as_ref().map_or(0, State::iteration);
                    self.core.register_restart(iteration)?;
                    self.core
                        .reinit(gw, &self.input, &self.reporter)
                        .map_err(ExpError::Arithmetic)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn execute<B: FftArith>(&mut self, gw: &mut B) -> Result<Outcome, ExpError> {
        let len = self.iterations();
        let x0 = gw.from_integer(&self.x0);
        let mut x = gw.alloc();
        let mut i = match &self.state {
            None => {
                gw.copy(&x0, &mut x);
                gw.carefully_count(30);
                0
            }
            Some(state) => {
                x = gw.from_integer(state.residue());
                state.iteration()
            }
        };

        while i < len {
            let bit = self.exp.get_bit(checked_u32(len - i - 1));
            let last = i + 1 == len;
            gw.square_inplace(&mut x, startnextfft_if(!last || bit))
                .map_err(ExpError::from)?;
            if bit {
                gw.mul_into(&x0, &mut x, startnextfft_if(!last))
                    .map_err(ExpError::from)?;
            }
            i += 1;
            if self.core.should_commit(i) {
                self.core.check(gw).map_err(ExpError::from)?;
                self.commit(gw, i, &x)?;
                if self.core.stop_requested() {
                    return Ok(Outcome::Interrupted);
                }
            }
        }

        if self.state.as_ref().map_or(true, |s| s.iteration() != len) {
            self.commit(gw, len, &x)?;
        }
        Ok(Outcome::Done)
    }

    fn commit<B: FftArith>(&mut self, gw: &mut B, i: u64, x: &B::Num) -> Result<(), ExpError> {
        let state = State::new(i, gw.to_integer(x));
        if let Some(file) = &self.file {
            if i == self.iterations() || self.core.should_write() {
                file.write(&state.to_record())
                    .map_err(|e| ExpError::Persist(e.to_string()))?;
                self.core.mark_written();
            }
        }
        self.core.progress(gw, &self.reporter, i);
        self.state = Some(state);
        Ok(())
    }
}

//! Left-to-right binary exponentiation with a small-integer base.
//!
//! The base rides along as the backend's mul-by-const, so every iteration
//! is a single squaring: X ← X²·(x0 if the bit is set) mod N. Total
//! iterations = bitlen(E) − 1. The first 30 operations run carefully to
//! stabilise the FFT against startup noise.

use rug::Integer;
use std::sync::Arc;

use crate::arith::{startnextfft_if, FftArith, MULBYCONST};
use crate::checked_u32;
use crate::progress::Reporter;
use crate::state::{State, StateFile};
use crate::task::{ExpConfig, ExpError, Outcome, TaskCore};

pub struct FastExp {
    input: crate::input::InputNum,
    exp: Integer,
    x0: u32,
    file: Option<StateFile>,
    state: Option<State>,
    reporter: Arc<Reporter>,
    core: TaskCore,
}

impl FastExp {
    pub fn new(
        input: crate::input::InputNum,
        exp: Integer,
        x0: u32,
        file: Option<StateFile>,
        reporter: Arc<Reporter>,
        config: ExpConfig,
    ) -> Result<Self, ExpError> {
        if exp < 1u32 {
            return Err(ExpError::Config("exponent must be at least 1".into()));
        }
        if x0 < 2 {
            return Err(ExpError::Config("base must be at least 2".into()));
        }
        let core = TaskCore::new(config);
        let mut driver = FastExp {
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

    /// bitlen(E) − 1 squarings.
    pub fn iterations(&self) -> u64 {
        u64::from(self.exp.significant_bits()) - 1
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Compute x0^E mod N, committing state as configured and restarting
    /// on transient arithmetic errors.
    pub fn run<B: FftArith>(&mut self, gw: &mut B) -> Result<Integer, ExpError> {
        if self.x0 > gw.max_mulbyconst() {
            return Err(ExpError::Config(format!(
                "x0 {} exceeds backend mul-by-const limit {}",
                self.x0,
                gw.max_mulbyconst()
            )));
        }
        self.reporter
            .set_prefix(&format!("{} ", self.input.display_text()));
        let period = self.core.config().muls_per_state_update;
        self.core.begin(gw, self.iterations(), period);
        if let Some(state) = &self.state {
            self.reporter.info(&format!(
                "restarting at {:.1}%.",
                100.0 * state.iteration() as f64 / self.iterations().max(1) as f64
            ));
        }
        if self.core.error_check() {
            self.reporter.info("max roundoff check enabled.");
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
        let mut x = gw.alloc();
        let mut i = match &self.state {
            None => {
                gw.set_small(&mut x, self.x0);
                gw.carefully_count(30);
                0
            }
            Some(state) => {
                x = gw.from_integer(state.residue());
                state.iteration()
            }
        };
        gw.set_mulbyconst(self.x0);

        while i < len {
            let bit = self.exp.get_bit(checked_u32(len - i - 1));
            let mut flags = startnextfft_if(i + 1 != len);
            if bit {
                flags |= MULBYCONST;
            }
            gw.square_inplace(&mut x, flags).map_err(ExpError::from)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arith::SoftFft;
    use crate::input::InputNum;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn mersenne31() -> InputNum {
        InputNum::new(1, 2, 31, -1).unwrap()
    }

    fn tight_config() -> ExpConfig {
        ExpConfig {
            muls_per_state_update: 1,
            write_interval: Duration::ZERO,
            ..ExpConfig::default()
        }
    }

    fn reference(x0: u32, exp: &Integer, input: &InputNum) -> Integer {
        Integer::from(x0)
            .pow_mod(exp, &input.value())
            .unwrap()
    }

    #[test]
    fn three_to_the_seventh() {
        // 3^7 mod 2^31-1: bits of 7 are 111, two squaring iterations
        let input = mersenne31();
        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input,
            Integer::from(7u32),
            3,
            None,
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        assert_eq!(driver.iterations(), 2);
        assert_eq!(driver.run(&mut gw).unwrap(), 2187);
    }

    #[test]
    fn exponent_one_is_base() {
        let input = mersenne31();
        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input,
            Integer::from(1u32),
            5,
            None,
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        assert_eq!(driver.iterations(), 0);
        assert_eq!(driver.run(&mut gw).unwrap(), 5);
    }

    #[test]
    fn matches_reference_across_bases() {
        let input = InputNum::new(3, 2, 20, 1).unwrap();
        let exp = Integer::from(0x1d3fb5u32);
        for x0 in [2u32, 3, 10, 255] {
            let mut gw = SoftFft::new(&input);
            let mut driver = FastExp::new(
                input.clone(),
                exp.clone(),
                x0,
                None,
                Reporter::new(),
                ExpConfig::default(),
            )
            .unwrap();
            assert_eq!(
                driver.run(&mut gw).unwrap(),
                reference(x0, &exp, &input),
                "x0 = {}",
                x0
            );
        }
    }

    #[test]
    fn resumes_from_state_file() {
        let input = mersenne31();
        let exp = Integer::from(0xdeadbeefu32);
        let len = u64::from(exp.significant_bits()) - 1;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fast.state");

        // Craft a state at iteration j: X = x0^(E >> (len - j)) mod N
        let j = 13u64;
        let prefix = Integer::from(&exp >> checked_u32(len - j));
        let residue = reference(3, &prefix, &input);
        StateFile::new(&path)
            .write(&State::new(j, residue).to_record())
            .unwrap();

        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input.clone(),
            exp.clone(),
            3,
            Some(StateFile::new(&path)),
            Reporter::new(),
            tight_config(),
        )
        .unwrap();
        assert_eq!(driver.state().unwrap().iteration(), j);
        assert_eq!(driver.run(&mut gw).unwrap(), reference(3, &exp, &input));
    }

    #[test]
    fn stale_state_beyond_iterations_is_ignored() {
        let input = mersenne31();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fast.state");
        StateFile::new(&path)
            .write(&State::new(10_000, Integer::from(4u32)).to_record())
            .unwrap();
        let driver = FastExp::new(
            input,
            Integer::from(7u32),
            3,
            Some(StateFile::new(&path)),
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        assert!(driver.state().is_none());
    }

    #[test]
    fn oversized_base_is_fatal() {
        let input = mersenne31();
        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input,
            Integer::from(7u32),
            SoftFft::MAX_MULBYCONST + 1,
            None,
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        assert!(matches!(driver.run(&mut gw), Err(ExpError::Config(_))));
    }

    #[test]
    fn zero_exponent_rejected() {
        let result = FastExp::new(
            mersenne31(),
            Integer::new(),
            3,
            None,
            Reporter::new(),
            ExpConfig::default(),
        );
        assert!(matches!(result, Err(ExpError::Config(_))));
    }

    #[test]
    fn roundoff_triggers_rebuild_and_resume() {
        let input = mersenne31();
        let exp = Integer::from(0xfedc1234u32);
        let mut gw = SoftFft::new(&input);
        gw.schedule_roundoff(9);
        let reporter = Reporter::new();
        let mut driver = FastExp::new(
            input.clone(),
            exp.clone(),
            3,
            None,
            Arc::clone(&reporter),
            tight_config(),
        )
        .unwrap();
        assert_eq!(driver.run(&mut gw).unwrap(), reference(3, &exp, &input));
        assert_eq!(driver.core.restart_count(), 1);
        // The rebuild re-reported the FFT parameters
        assert!(reporter.param("fft_desc").is_some());
    }

    #[test]
    fn stop_flag_interrupts_at_commit() {
        let input = mersenne31();
        let stop = Arc::new(AtomicBool::new(true));
        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input,
            Integer::from(0xffffffu32),
            3,
            None,
            Reporter::new(),
            ExpConfig {
                stop: Some(stop),
                ..tight_config()
            },
        )
        .unwrap();
        match driver.run(&mut gw) {
            Err(ExpError::Interrupted { iteration }) => assert_eq!(iteration, 1),
            other => panic!("expected interruption, got {:?}", other.err()),
        }
    }

    #[test]
    fn progress_reaches_one() {
        let input = mersenne31();
        let reporter = Reporter::new();
        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input,
            Integer::from(1000u32),
            3,
            None,
            Arc::clone(&reporter),
            ExpConfig::default(),
        )
        .unwrap();
        driver.run(&mut gw).unwrap();
        assert_eq!(reporter.done_fraction(), 1.0);
        assert!(reporter.transforms_done() > 0);
    }

    #[test]
    fn final_state_written_to_file() {
        let input = mersenne31();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fast.state");
        let exp = Integer::from(12345u32);
        let mut gw = SoftFft::new(&input);
        let mut driver = FastExp::new(
            input.clone(),
            exp.clone(),
            3,
            Some(StateFile::new(&path)),
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        let result = driver.run(&mut gw).unwrap();
        let loaded = State::from_record(&StateFile::new(&path).read().unwrap()).unwrap();
        assert_eq!(loaded.iteration(), driver.iterations());
        assert_eq!(*loaded.residue(), result);
    }
}

//! Multipoint exponentiation: advance X across an increasing sequence of
//! checkpoint iterations, raising it to b^Δ between consecutive points.
//!
//! For b = 2 a segment is Δ plain squarings. Otherwise the windowed
//! kernel [`sliding_window`] consumes up to W bits of the segment
//! exponent per multiply, with W chosen by an analytic cost model and a
//! precomputed table of odd powers. The kernel is a free function so the
//! Gerbicz driver can reuse it, including in careful mode.

use rug::ops::Pow;
use rug::Integer;
use std::sync::Arc;

use crate::arith::{startnextfft_if, FftArith, GwError, CAREFUL, FFT_S1, FFT_S2, STARTNEXTFFT};
use crate::checked_u32;
use crate::input::InputNum;
use crate::progress::Reporter;
use crate::state::{State, StateFile};
use crate::task::{ExpConfig, ExpError, Outcome, TaskCore};

/// Predicted multiply count for window width w over a len-bit scan.
pub(crate) fn window_cost(w: u32, len: u64) -> f64 {
    (1u64 << (w - 1)) as f64 + len as f64 * (1.0 + 1.0 / (w as f64 + 1.0))
}

/// Smallest window width W ≥ 2 whose predicted cost one more bit of
/// window would not improve, subject to the advisory maximum width and
/// the precomputed-table capacity (`None` disables a bound).
pub fn select_window(len: u64, max_w: Option<u32>, max_size: Option<u64>) -> u32 {
    let mut w = 2u32;
    loop {
        let widen = max_w.map_or(true, |m| w < m)
            && max_size.map_or(true, |m| (1u64 << (w + 1)) <= m)
            && window_cost(w, len) > window_cost(w + 1, len);
        if !widen {
            return w;
        }
        w += 1;
    }
}

/// Windowed left-to-right exponentiation: X ← X^exp mod N.
///
/// `u` is the caller-owned odd-powers table (U\[i\] = X^(2i+1)); entries
/// are reused across calls and the table grows on demand. With `careful`
/// set, every operation (including the precomputation) runs with
/// conservative numerics.
pub fn sliding_window<B: FftArith>(
    gw: &mut B,
    exp: &Integer,
    x: &mut B::Num,
    u: &mut Vec<B::Num>,
    careful: bool,
    max_w: Option<u32>,
    max_size: Option<u64>,
) -> Result<(), GwError> {
    debug_assert!(*exp >= 1u32);
    let len = i64::from(exp.significant_bits()) - 1;
    let w = select_window(len.max(0) as u64, max_w, max_size);
    let c = if careful { CAREFUL } else { 0 };

    // Precompute odd powers: U[0] takes the incoming X, the running X
    // becomes X² and feeds each further entry.
    let table = 1usize << (w - 1);
    if u.is_empty() {
        u.push(gw.alloc());
    }
    std::mem::swap(&mut u[0], x);
    gw.square(&u[0], x, STARTNEXTFFT | c)?;
    for idx in 1..table {
        if u.len() <= idx {
            u.push(gw.alloc());
        }
        let (head, tail) = u.split_at_mut(idx);
        gw.mul3(x, &head[idx - 1], &mut tail[0], FFT_S1 | FFT_S2 | STARTNEXTFFT | c)?;
    }

    let mut i = len;
    while i >= 0 {
        if !exp.get_bit(checked_u32(i as u64)) {
            gw.square_inplace(x, startnextfft_if(i > 0) | c)?;
            i -= 1;
        } else {
            let mut j = (i - i64::from(w) + 1).max(0);
            while !exp.get_bit(checked_u32(j as u64)) {
                j += 1;
            }
            let mut ui: usize = 0;
            if i == len {
                // First window of the scan: no squarings have happened yet,
                // the table entry is the value itself.
                while i >= j {
                    ui = (ui << 1) | usize::from(exp.get_bit(checked_u32(i as u64)));
                    i -= 1;
                }
                gw.copy(&u[ui / 2], x);
                continue;
            }
            while i >= j {
                gw.square_inplace(x, STARTNEXTFFT | c)?;
                ui = (ui << 1) | usize::from(exp.get_bit(checked_u32(i as u64)));
                i -= 1;
            }
            gw.mul_into(&u[ui / 2], x, FFT_S1 | startnextfft_if(i > 0) | c)?;
        }
    }
    Ok(())
}

/// Driver for checkpointed exponentiation by b^Δ segments.
pub struct MultipointExp {
    input: InputNum,
    b: u32,
    points: Vec<u64>,
    max_w: Option<u32>,
    max_table: Option<u64>,
    file: Option<StateFile>,
    state: Option<State>,
    on_point: Option<Box<dyn FnMut(u64)>>,
    reporter: Arc<Reporter>,
    core: TaskCore,
}

impl MultipointExp {
    /// `base` is the starting residue X₀; the residue emitted at point p
    /// is base^(b^p) mod N.
    pub fn new(
        input: InputNum,
        b: u32,
        points: Vec<u64>,
        base: Integer,
        file: Option<StateFile>,
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
        let core = TaskCore::new(config);
        let mut driver = MultipointExp {
            input,
            b,
            points,
            max_w: None,
            max_table: None,
            file,
            state: None,
            on_point: None,
            reporter,
            core,
        };
        driver.state = driver
            .load_state()
            .or_else(|| Some(State::new(0, base)));
        Ok(driver)
    }

    /// Advisory maximum window width (the cost model may pick less).
    pub fn set_max_window(&mut self, max_w: Option<u32>) {
        self.max_w = max_w;
    }

    /// Cap on the precomputed odd-powers table.
    pub fn set_max_table(&mut self, max_table: Option<u64>) {
        self.max_table = max_table;
    }

    /// Callback invoked once per reached checkpoint, after the commit.
    pub fn on_point(&mut self, callback: impl FnMut(u64) + 'static) {
        self.on_point = Some(Box::new(callback));
    }

    fn load_state(&self) -> Option<State> {
        let record = self.file.as_ref()?.read()?;
        let state = State::from_record(&record)?;
        (state.iteration() <= self.iterations()).then_some(state)
    }

    pub fn iterations(&self) -> u64 {
        *self.points.last().expect("validated non-empty")
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    pub fn points(&self) -> &[u64] {
        &self.points
    }

    /// Predicted multiplication count for the whole schedule.
    pub fn cost(&self) -> f64 {
        let n = self.iterations();
        if self.b == 2 {
            return n as f64;
        }
        let log2b = f64::from(self.b).log2();
        let mut total = 0.0;
        let mut prev = 0u64;
        for &p in &self.points {
            let len = ((p - prev) as f64 * log2b) as u64;
            if len > 0 {
                let w = select_window(len, self.max_w, self.max_table);
                total += window_cost(w, len);
            }
            prev = p;
        }
        total
    }

    pub fn run<B: FftArith>(&mut self, gw: &mut B) -> Result<Integer, ExpError> {
        self.reporter
            .set_prefix(&format!("{} ", self.input.display_text()));
        let period = self.core.config().muls_per_state_update;
        self.core.begin(gw, self.iterations(), period);
        let start = self.state.as_ref().map_or(0, State::iteration);
        if start > 0 {
            self.reporter.info(&format!(
                "restarting at {:.1}%.",
                100.0 * start as f64 / self.iterations() as f64
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
        let iterations = self.iterations();
        let state = self.state.as_ref().expect("initial state always present");
        let mut i = state.iteration();
        let mut x = gw.from_integer(state.residue());
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
            let p = self.points[next_point];
            if self.b == 2 {
                while i < p {
                    gw.square_inplace(
                        &mut x,
                        startnextfft_if(i + 1 != iterations && i + 1 != p),
                    )
                    .map_err(ExpError::from)?;
                    i += 1;
                    if self.core.should_commit(i) && i != p {
                        self.core.check(gw).map_err(ExpError::from)?;
                        self.commit(gw, i, &x, false)?;
                        if self.core.stop_requested() {
                            return Ok(Outcome::Interrupted);
                        }
                    }
                }
            } else {
                let delta = p - i;
                if last_power != Some(delta) {
                    last_power = Some(delta);
                    seg_exp = Integer::from(self.b).pow(checked_u32(delta));
                }
                sliding_window(gw, &seg_exp, &mut x, &mut u, false, self.max_w, self.max_table)
                    .map_err(ExpError::from)?;
                i = p;
            }

            if self.state.as_ref().map_or(true, |s| s.iteration() != i) {
                self.core.check(gw).map_err(ExpError::from)?;
                self.commit(gw, i, &x, true)?;
            }
            if let Some(callback) = &mut self.on_point {
                callback(i);
                self.core.mark_written();
            }
            if self.core.stop_requested() {
                return Ok(Outcome::Interrupted);
            }
            next_point += 1;
        }

        Ok(Outcome::Done)
    }

    fn commit<B: FftArith>(
        &mut self,
        gw: &mut B,
        i: u64,
        x: &B::Num,
        force_write: bool,
    ) -> Result<(), ExpError> {
        let state = State::new(i, gw.to_integer(x));
        if let Some(file) = &self.file {
            if force_write || self.core.should_write() {
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
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn prime10007() -> InputNum {
        InputNum::new(1, 10, 4, 7).unwrap()
    }

    // ── Window selection ────────────────────────────────────────────

    #[test]
    fn short_exponents_get_minimal_window() {
        assert_eq!(select_window(1, None, None), 2);
        assert_eq!(select_window(8, None, None), 2);
    }

    #[test]
    fn window_grows_with_exponent_length() {
        let small = select_window(64, None, None);
        let large = select_window(1 << 20, None, None);
        assert!(large > small);
    }

    #[test]
    fn window_honours_advisory_bound() {
        let unbounded = select_window(1 << 20, None, None);
        assert!(unbounded > 3);
        assert_eq!(select_window(1 << 20, Some(3), None), 3);
    }

    #[test]
    fn window_honours_table_capacity() {
        // 2^(W+1) ≤ 16 allows widening while W+1 ≤ 3
        let capped = select_window(1 << 20, None, Some(16));
        assert_eq!(capped, 3);
    }

    #[test]
    fn window_is_cost_minimiser() {
        // The documented predicate: stop at the first W where one more bit
        // does not pay. Every narrower width must still be improving.
        for len in [1u64, 10, 100, 1000, 10_000, 1 << 20] {
            let w = select_window(len, None, None);
            assert!(window_cost(w, len) <= window_cost(w + 1, len), "len={}", len);
            for v in 2..w {
                assert!(window_cost(v, len) > window_cost(v + 1, len), "len={}", len);
            }
        }
    }

    // ── Sliding window kernel ───────────────────────────────────────

    fn window_reference(x: u64, exp: &Integer, input: &InputNum) -> Integer {
        Integer::from(x).pow_mod(exp, &input.value()).unwrap()
    }

    #[test]
    fn kernel_matches_reference() {
        let input = prime10007();
        for exp in [1u64, 2, 3, 7, 243, 1 << 20, 0xdead_beef] {
            let exp = Integer::from(exp);
            let mut gw = SoftFft::new(&input);
            let mut x = gw.from_integer(&Integer::from(2u32));
            let mut u = Vec::new();
            sliding_window(&mut gw, &exp, &mut x, &mut u, false, None, None).unwrap();
            assert_eq!(
                gw.to_integer(&x),
                window_reference(2, &exp, &input),
                "exp = {}",
                exp
            );
        }
    }

    #[test]
    fn kernel_matches_reference_for_every_window_bound() {
        let input = prime10007();
        let exp = Integer::from(0x1234_5678_9abcu64);
        for max_w in [Some(2u32), Some(3), Some(5), None] {
            let mut gw = SoftFft::new(&input);
            let mut x = gw.from_integer(&Integer::from(123u32));
            let mut u = Vec::new();
            sliding_window(&mut gw, &exp, &mut x, &mut u, false, max_w, None).unwrap();
            assert_eq!(
                gw.to_integer(&x),
                window_reference(123, &exp, &input),
                "max_w = {:?}",
                max_w
            );
        }
    }

    #[test]
    fn kernel_careful_mode_is_bit_identical() {
        let input = prime10007();
        let exp = Integer::from(59049u32); // 3^10
        let mut gw = SoftFft::new(&input);
        let mut x = gw.from_integer(&Integer::from(2u32));
        let mut u = Vec::new();
        sliding_window(&mut gw, &exp, &mut x, &mut u, true, None, None).unwrap();
        assert_eq!(gw.to_integer(&x), window_reference(2, &exp, &input));
    }

    #[test]
    fn kernel_table_is_reusable_across_calls() {
        let input = prime10007();
        let mut gw = SoftFft::new(&input);
        let mut x = gw.from_integer(&Integer::from(5u32));
        let mut u = Vec::new();
        let exp = Integer::from(243u32);
        sliding_window(&mut gw, &exp, &mut x, &mut u, false, None, None).unwrap();
        sliding_window(&mut gw, &exp, &mut x, &mut u, false, None, None).unwrap();
        let expected = window_reference(5, &Integer::from(243u32 * 243), &input);
        assert_eq!(gw.to_integer(&x), expected);
    }

    // ── Multipoint driver ───────────────────────────────────────────

    fn collect_points(
        driver: &mut MultipointExp,
        file: &StateFile,
    ) -> Rc<RefCell<Vec<(u64, Integer)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let file = file.clone();
        driver.on_point(move |i| {
            let state = State::from_record(&file.read().unwrap()).unwrap();
            assert_eq!(state.iteration(), i);
            seen2.borrow_mut().push((i, state.residue().clone()));
        });
        seen
    }

    #[test]
    fn base3_checkpoints_match_reference() {
        // Residue at point p is 2^(3^p) mod 10007
        let input = prime10007();
        let n = input.value();
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("mp.state"));
        let mut gw = SoftFft::new(&input);
        let mut driver = MultipointExp::new(
            input.clone(),
            3,
            vec![5, 10],
            Integer::from(2u32),
            Some(file.clone()),
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        let seen = collect_points(&mut driver, &file);
        let last = driver.run(&mut gw).unwrap();

        let at5 = Integer::from(2u32)
            .pow_mod(&Integer::from(3u32).pow(5), &n)
            .unwrap();
        let at10 = at5.clone().pow_mod(&Integer::from(3u32).pow(5), &n).unwrap();
        assert_eq!(*seen.borrow(), vec![(5, at5), (10, at10.clone())]);
        assert_eq!(last, at10);
    }

    #[test]
    fn base2_checkpoints_are_repeated_squarings() {
        // Residues 2^(2^100), 2^(2^200), 2^(2^300) mod 2^61-1
        let input = InputNum::new(1, 2, 61, -1).unwrap();
        let n = input.value();
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("mp2.state"));
        let mut gw = SoftFft::new(&input);
        let mut driver = MultipointExp::new(
            input.clone(),
            2,
            vec![100, 200, 300],
            Integer::from(2u32),
            Some(file.clone()),
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        let seen = collect_points(&mut driver, &file);
        driver.run(&mut gw).unwrap();

        let mut expected = Integer::from(2u32);
        let mut reference = Vec::new();
        for step in 1..=300u64 {
            expected = expected.clone().pow_mod(&Integer::from(2u32), &n).unwrap();
            if step % 100 == 0 {
                reference.push((step, expected.clone()));
            }
        }
        assert_eq!(*seen.borrow(), reference);
    }

    #[test]
    fn resumes_mid_segment() {
        let input = InputNum::new(1, 2, 61, -1).unwrap();
        let n = input.value();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mp.state");

        // State at iteration 150: 2^(2^150) mod N
        let mut residue = Integer::from(2u32);
        for _ in 0..150 {
            residue = residue.clone().pow_mod(&Integer::from(2u32), &n).unwrap();
        }
        StateFile::new(&path)
            .write(&State::new(150, residue).to_record())
            .unwrap();

        let mut gw = SoftFft::new(&input);
        let mut driver = MultipointExp::new(
            input.clone(),
            2,
            vec![100, 200],
            Integer::from(2u32),
            Some(StateFile::new(&path)),
            Reporter::new(),
            ExpConfig {
                write_interval: Duration::ZERO,
                ..ExpConfig::default()
            },
        )
        .unwrap();
        let final_residue = driver.run(&mut gw).unwrap();

        let mut expected = Integer::from(2u32);
        for _ in 0..200 {
            expected = expected.clone().pow_mod(&Integer::from(2u32), &n).unwrap();
        }
        assert_eq!(final_residue, expected);
    }

    #[test]
    fn equal_segments_reuse_cached_power() {
        // Equal spacing exercises the last_power cache; result must still
        // telescope correctly.
        let input = prime10007();
        let n = input.value();
        let mut gw = SoftFft::new(&input);
        let mut driver = MultipointExp::new(
            input.clone(),
            7,
            vec![3, 6, 9, 12],
            Integer::from(5u32),
            None,
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        let result = driver.run(&mut gw).unwrap();
        let expected = Integer::from(5u32)
            .pow_mod(&Integer::from(7u32).pow(12), &n)
            .unwrap();
        assert_eq!(result, expected);
    }

    #[test]
    fn rejects_bad_checkpoints() {
        let input = prime10007();
        for points in [vec![], vec![0, 5], vec![5, 5], vec![7, 3]] {
            let result = MultipointExp::new(
                input.clone(),
                3,
                points.clone(),
                Integer::from(2u32),
                None,
                Reporter::new(),
                ExpConfig::default(),
            );
            assert!(
                matches!(result, Err(ExpError::Config(_))),
                "points {:?} accepted",
                points
            );
        }
    }

    #[test]
    fn cost_prefers_windowing_over_binary() {
        let input = prime10007();
        let driver = MultipointExp::new(
            input.clone(),
            3,
            vec![10_000],
            Integer::from(2u32),
            None,
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        let len = (10_000.0 * 3f64.log2()) as u64;
        // Windowed cost beats one multiply per bit on top of the squarings
        assert!(driver.cost() < 2.0 * len as f64);
        assert!(driver.cost() > len as f64);
    }

    #[test]
    fn b2_cost_is_iteration_count() {
        let input = InputNum::new(1, 2, 61, -1).unwrap();
        let driver = MultipointExp::new(
            input,
            2,
            vec![100, 300],
            Integer::from(2u32),
            None,
            Reporter::new(),
            ExpConfig::default(),
        )
        .unwrap();
        assert_eq!(driver.cost(), 300.0);
    }
}

//! Logging and progress reporting for exponentiation drivers.
//!
//! A [`Reporter`] is the single text/metrics sink a driver talks to: a
//! settable prefix (the input number's display form), structured
//! parameters like the FFT description, and a progress channel fed with
//! `(done_fraction, transforms_done)` at commit points and on completion.
//! Text goes to `tracing`; the latest values stay readable behind atomics
//! so an embedding application can poll them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub struct Reporter {
    prefix: Mutex<String>,
    params: Mutex<HashMap<String, String>>,
    done_millionths: AtomicU64,
    transforms_done: AtomicU64,
}

impl Reporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Reporter {
            prefix: Mutex::new(String::new()),
            params: Mutex::new(HashMap::new()),
            done_millionths: AtomicU64::new(0),
            transforms_done: AtomicU64::new(0),
        })
    }

    pub fn set_prefix(&self, prefix: &str) {
        *self.prefix.lock().unwrap() = prefix.to_string();
    }

    pub fn prefix(&self) -> String {
        self.prefix.lock().unwrap().clone()
    }

    pub fn info(&self, msg: &str) {
        info!(prefix = %self.prefix(), "{}", msg);
    }

    pub fn warn(&self, msg: &str) {
        warn!(prefix = %self.prefix(), "{}", msg);
    }

    pub fn error(&self, msg: &str) {
        error!(prefix = %self.prefix(), "{}", msg);
    }

    /// Record a structured field (e.g. `fft_desc`, `fft_len`).
    pub fn report_param(&self, name: &str, value: impl ToString) {
        let value = value.to_string();
        info!(prefix = %self.prefix(), name, value = %value, "param");
        self.params.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn param(&self, name: &str) -> Option<String> {
        self.params.lock().unwrap().get(name).cloned()
    }

    /// Progress channel: fraction of iterations done and transforms spent.
    pub fn update(&self, done_fraction: f64, transforms_done: u64) {
        let clamped = done_fraction.clamp(0.0, 1.0);
        self.done_millionths
            .store((clamped * 1_000_000.0) as u64, Ordering::Relaxed);
        self.transforms_done.store(transforms_done, Ordering::Relaxed);
    }

    pub fn done_fraction(&self) -> f64 {
        self.done_millionths.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn transforms_done(&self) -> u64 {
        self.transforms_done.load(Ordering::Relaxed)
    }
}

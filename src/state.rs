//! Persisted driver state.
//!
//! One tagged record per file. Writes go through a temp-file rename so a
//! crash mid-write leaves the previous record intact; unreadable or absent
//! files load as `None`, which the drivers treat as "start from scratch".
//!
//! Residues travel as lowercase hex so the files stay portable across
//! backends and word sizes.

use anyhow::{anyhow, Result};
use rug::Integer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk record, discriminated by the `type` tag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum StateRecord {
    /// Plain exponentiation state: iteration and residue.
    Exp { iteration: u64, residue: String },
    /// Gerbicz working state: iteration, residue and check accumulator.
    GerbiczCheck {
        iteration: u64,
        residue: String,
        check: String,
    },
    /// Bare progress marker (no residue): the working position right after
    /// a verified block, where the residue lives in the recovery file.
    Marker { iteration: u64 },
}

/// Iteration + residue, the recovery-grade state.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    iteration: u64,
    residue: Integer,
}

impl State {
    pub fn new(iteration: u64, residue: Integer) -> Self {
        State { iteration, residue }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn residue(&self) -> &Integer {
        &self.residue
    }

    pub fn to_record(&self) -> StateRecord {
        StateRecord::Exp {
            iteration: self.iteration,
            residue: encode(&self.residue),
        }
    }

    pub fn from_record(record: &StateRecord) -> Option<Self> {
        match record {
            StateRecord::Exp { iteration, residue } => Some(State {
                iteration: *iteration,
                residue: decode(residue).ok()?,
            }),
            _ => None,
        }
    }
}

/// Iteration, residue and rolling check accumulator, the working-grade
/// state committed inside a Gerbicz block.
#[derive(Debug, Clone, PartialEq)]
pub struct GerbiczCheckState {
    iteration: u64,
    residue: Integer,
    check: Integer,
}

impl GerbiczCheckState {
    pub fn new(iteration: u64, residue: Integer, check: Integer) -> Self {
        GerbiczCheckState {
            iteration,
            residue,
            check,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn residue(&self) -> &Integer {
        &self.residue
    }

    pub fn check(&self) -> &Integer {
        &self.check
    }

    pub fn to_record(&self) -> StateRecord {
        StateRecord::GerbiczCheck {
            iteration: self.iteration,
            residue: encode(&self.residue),
            check: encode(&self.check),
        }
    }

    pub fn from_record(record: &StateRecord) -> Option<Self> {
        match record {
            StateRecord::GerbiczCheck {
                iteration,
                residue,
                check,
            } => Some(GerbiczCheckState {
                iteration: *iteration,
                residue: decode(residue).ok()?,
                check: decode(check).ok()?,
            }),
            _ => None,
        }
    }
}

fn encode(v: &Integer) -> String {
    v.to_string_radix(16)
}

fn decode(s: &str) -> Result<Integer> {
    Integer::from_str_radix(s, 16).map_err(|e| anyhow!("bad residue hex: {}", e))
}

/// A single-record state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        StateFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the file's record.
    pub fn write(&self, record: &StateRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read the record, treating a corrupt or absent file as no state.
    pub fn read(&self) -> Option<StateRecord> {
        let data = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&data).ok()
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

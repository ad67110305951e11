/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crash::{normalize_rel, CrashAction, CrashOp};

/// When and how a simulated crash fires.
///
/// Empty `ops` means every operation is eligible. `paths` match exactly;
/// `path_prefixes` match the path itself or any descendant. `after` is a
/// 1-indexed count of eligible operations (0 disables counting); `rate`
/// is a per-eligible-operation probability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailpointConfig {
    pub after: u64,
    pub seed: i64,
    pub rate: f64,
    pub ops: Vec<CrashOp>,
    pub paths: Vec<String>,
    pub path_prefixes: Vec<String>,
    pub action: CrashAction,
    pub exit_code: i32,
}

impl Default for FailpointConfig {
    fn default() -> Self {
        FailpointConfig {
            after: 0,
            seed: 0,
            rate: 0.0,
            ops: Vec::new(),
            paths: Vec::new(),
            path_prefixes: Vec::new(),
            action: CrashAction::Panic,
            exit_code: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FailpointError {
    #[error("rate {0} outside [0, 1]")]
    InvalidRate(f64),
    #[error("path '{0}' escapes the filesystem root")]
    PathEscapesRoot(String),
    #[error("exit action requires a nonzero exit code")]
    MissingExitCode,
    #[error("panic action does not take an exit code")]
    UnexpectedExitCode,
}

/// The armed engine. Counters advance under the crash-simulator lock, so
/// the sequence number of eligible operations is well-defined for a
/// fixed call schedule. Disarms itself after the first trigger.
pub(crate) struct Failpoint {
    ops: HashSet<CrashOp>,
    paths: HashSet<PathBuf>,
    prefixes: Vec<PathBuf>,
    after: u64,
    rate: f64,
    rng: Pcg32,
    counter: u64,
    armed: bool,
    action: CrashAction,
    exit_code: i32,
}

impl Failpoint {
    pub fn new(config: &FailpointConfig) -> Result<Self, FailpointError> {
        if !(0.0..=1.0).contains(&config.rate) || config.rate.is_nan() {
            return Err(FailpointError::InvalidRate(config.rate));
        }
        match config.action {
            CrashAction::Exit if config.exit_code == 0 => {
                return Err(FailpointError::MissingExitCode);
            }
            CrashAction::Panic if config.exit_code != 0 => {
                return Err(FailpointError::UnexpectedExitCode);
            }
            _ => {}
        }
        let mut paths = HashSet::new();
        for raw in &config.paths {
            let rel = normalize_rel(Path::new(raw))
                .ok_or_else(|| FailpointError::PathEscapesRoot(raw.clone()))?;
            paths.insert(rel);
        }
        let mut prefixes = Vec::new();
        for raw in &config.path_prefixes {
            let rel = normalize_rel(Path::new(raw))
                .ok_or_else(|| FailpointError::PathEscapesRoot(raw.clone()))?;
            prefixes.push(rel);
        }
        let has_filters = !config.ops.is_empty() || !paths.is_empty() || !prefixes.is_empty();
        let mut after = config.after;
        // a filter with no trigger means "fire on the first hit"
        if has_filters && after == 0 && config.rate == 0.0 {
            after = 1;
        }
        Ok(Failpoint {
            ops: config.ops.iter().copied().collect(),
            paths,
            prefixes,
            after,
            rate: config.rate,
            rng: Pcg32::seed_from_u64(config.seed as u64),
            counter: 0,
            armed: after > 0 || config.rate > 0.0,
            action: config.action,
            exit_code: config.exit_code,
        })
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn action(&self) -> CrashAction {
        self.action
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// For rename, either side may satisfy the path filters.
    pub fn eligible(&self, op: CrashOp, rel: &Path, new_rel: Option<&Path>) -> bool {
        if !self.ops.is_empty() && !self.ops.contains(&op) {
            return false;
        }
        if self.paths.is_empty() && self.prefixes.is_empty() {
            return true;
        }
        self.path_matches(rel) || new_rel.map(|rel| self.path_matches(rel)).unwrap_or(false)
    }

    fn path_matches(&self, rel: &Path) -> bool {
        if self.paths.contains(rel) {
            return true;
        }
        // component-wise: prefix "a" matches "a" and "a/b", never "ab"
        self.prefixes.iter().any(|prefix| rel.starts_with(prefix))
    }

    /// Counts one eligible operation and decides whether to trigger.
    /// Returns the trigger decision and the operation's sequence number.
    pub fn advance(&mut self) -> (bool, u64) {
        self.counter += 1;
        let seq = self.counter;
        if self.after > 0 && self.counter == self.after {
            return (true, seq);
        }
        if self.rate > 0.0 && self.rng.gen::<f64>() < self.rate {
            return (true, seq);
        }
        (false, seq)
    }
}

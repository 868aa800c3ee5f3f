//! Parameter sweeps: the parameter space, its combinations, and the queue that tracks which
//! combinations still have to run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use itertools::Itertools;

use log::{info, warn};

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Name of the sweep state file kept in a campaign's result directory.
pub const SWEEP_STATE_FILE: &str = "sweeps.json";

/// One assignment of a value to every parameter of a sweep.
///
/// Keys are kept sorted, so two combinations with the same assignments are equal, hash the same
/// and produce the same slug.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Combination(BTreeMap<String, i64>);

impl Combination {
    /// The values, in order of parameter name.
    pub fn values(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.values().copied()
    }

    /// A deterministic, file-name-safe rendering: `key-value` pairs in key order, joined with
    /// `-`.
    pub fn slug(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}-{}", k, v))
            .join("-")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl std::iter::FromIterator<(String, i64)> for Combination {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Combination(iter.into_iter().collect())
    }
}

impl std::fmt::Display for Combination {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// The parameters of a sweep and their allowed values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpace(BTreeMap<String, Vec<i64>>);

impl ParamSpace {
    pub fn new() -> Self {
        ParamSpace(BTreeMap::new())
    }

    /// The parameter space of the n-tier simulation campaign.
    pub fn ntier_default() -> Self {
        let mut space = ParamSpace::new();
        space.insert("http_c1.xlarge", 0..1);
        space.insert("http_m1.large", 1..4);
        space.insert("app_c1.medium", 1..6);
        space.insert("db_m2.xlarge", 0..3);
        space.insert("db_m1.medium", 0..3);
        space
    }

    /// Set the allowed values of `param`, replacing any previous ones. Values are deduplicated.
    pub fn insert<I: IntoIterator<Item = i64>>(&mut self, param: &str, values: I) {
        let values: BTreeSet<i64> = values.into_iter().collect();
        self.0.insert(param.to_owned(), values.into_iter().collect());
    }

    /// Parse and insert a parameter specification: `name=LO..HI` (half-open) or
    /// `name=V1,V2,...`.
    pub fn insert_spec(&mut self, spec: &str) -> Result<(), RunnerError> {
        let bad = || RunnerError::BadParameter { spec: spec.into() };

        let mut split = spec.splitn(2, '=');
        let name = split.next().map(str::trim).filter(|n| !n.is_empty());
        let values = split.next().map(str::trim);

        let (name, values) = match (name, values) {
            (Some(name), Some(values)) => (name, values),
            _ => return Err(bad()),
        };

        if let Some((lo, hi)) = split_range(values) {
            let lo = lo.trim().parse::<i64>().map_err(|_| bad())?;
            let hi = hi.trim().parse::<i64>().map_err(|_| bad())?;
            self.insert(name, lo..hi);
        } else {
            let values = values
                .split(',')
                .map(|v| v.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| bad())?;
            self.insert(name, values);
        }

        Ok(())
    }

    /// Every combination of the space: the Cartesian product of all parameters' values, in
    /// lexicographic order of the values (parameters ordered by name).
    ///
    /// A space with no parameters has exactly one, empty, combination. A parameter with no
    /// values makes the product empty.
    pub fn combinations(&self) -> Vec<Combination> {
        if self.0.is_empty() {
            return vec![Combination::default()];
        }
        if self.0.values().any(Vec::is_empty) {
            return vec![];
        }

        let names: Vec<&String> = self.0.keys().collect();

        self.0
            .values()
            .map(|values| values.iter().copied())
            .multi_cartesian_product()
            .map(|values| {
                names
                    .iter()
                    .map(|name| (*name).clone())
                    .zip(values)
                    .collect()
            })
            .collect()
    }
}

fn split_range(values: &str) -> Option<(&str, &str)> {
    let idx = values.find("..")?;
    Some((&values[..idx], &values[idx + 2..]))
}

/// The finished part of a sweep, as saved to the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SweepState {
    completed: Vec<Combination>,
    canceled: Vec<Combination>,
}

/// The partition of all combinations of a sweep into remaining, in-progress, completed and
/// canceled. Every combination is in exactly one of them.
#[derive(Debug)]
pub struct SweepQueue {
    remaining: VecDeque<Combination>,
    in_progress: BTreeSet<Combination>,
    completed: BTreeSet<Combination>,
    canceled: BTreeSet<Combination>,

    /// Where to save the state after every terminal transition, if anywhere.
    state_file: Option<PathBuf>,
}

impl SweepQueue {
    /// A queue with every combination remaining. Duplicates are dropped.
    pub fn new(combinations: Vec<Combination>) -> Self {
        let mut seen = BTreeSet::new();
        let remaining = combinations
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();

        SweepQueue {
            remaining,
            in_progress: BTreeSet::new(),
            completed: BTreeSet::new(),
            canceled: BTreeSet::new(),
            state_file: None,
        }
    }

    /// A queue that saves its state to `state_file`. If the file already exists, the completed
    /// and canceled combinations it lists are restored; everything else is remaining.
    pub fn with_state_file(
        combinations: Vec<Combination>,
        state_file: &Path,
    ) -> Result<Self, failure::Error> {
        let mut queue = Self::new(combinations);
        queue.state_file = Some(state_file.to_owned());

        if !state_file.exists() {
            return Ok(queue);
        }

        let state: SweepState = serde_json::from_str(&std::fs::read_to_string(state_file)?)?;

        let restore = |queue: &mut SweepQueue, c: Combination, completed: bool| {
            if let Some(pos) = queue.remaining.iter().position(|r| *r == c) {
                queue.remaining.remove(pos);
                if completed {
                    queue.completed.insert(c);
                } else {
                    queue.canceled.insert(c);
                }
            } else {
                warn!(
                    "Ignoring saved combination {} which is not part of this sweep",
                    c
                );
            }
        };

        for c in state.completed {
            restore(&mut queue, c, true);
        }
        for c in state.canceled {
            restore(&mut queue, c, false);
        }

        info!(
            "Resumed sweep from {}: {} completed, {} canceled, {} remaining",
            state_file.display(),
            queue.completed.len(),
            queue.canceled.len(),
            queue.remaining.len()
        );

        Ok(queue)
    }

    /// Move the next remaining combination to in-progress and return it.
    pub fn next(&mut self) -> Option<Combination> {
        let combination = self.remaining.pop_front()?;
        self.in_progress.insert(combination.clone());
        Some(combination)
    }

    /// Move an in-progress combination to completed (`success`) or canceled.
    ///
    /// # Panics
    ///
    /// If `combination` is not in progress. In particular, a second terminal report for the
    /// same combination is a bug.
    pub fn done(&mut self, combination: &Combination, success: bool) {
        if !self.in_progress.remove(combination) {
            let state = if self.completed.contains(combination) {
                "completed"
            } else if self.canceled.contains(combination) {
                "canceled"
            } else {
                "not dispatched"
            };
            panic!(
                "combination {} finished while not in progress (it is {})",
                combination, state
            );
        }

        if success {
            self.completed.insert(combination.clone());
        } else {
            self.canceled.insert(combination.clone());
        }

        if let Err(err) = self.save() {
            warn!("Unable to save sweep state: {}", err);
        }
    }

    fn save(&self) -> Result<(), failure::Error> {
        let state_file = match &self.state_file {
            Some(state_file) => state_file,
            None => return Ok(()),
        };

        let state = SweepState {
            completed: self.completed.iter().cloned().collect(),
            canceled: self.canceled.iter().cloned().collect(),
        };

        let tmp = state_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&state)?)?;
        std::fs::rename(&tmp, state_file)?;

        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.len()
    }

    pub fn completed(&self) -> &BTreeSet<Combination> {
        &self.completed
    }

    pub fn canceled(&self) -> &BTreeSet<Combination> {
        &self.canceled
    }

    /// Total number of combinations, which never changes.
    pub fn len(&self) -> usize {
        self.remaining.len() + self.in_progress.len() + self.completed.len() + self.canceled.len()
    }

    /// Where `combination` currently is. Used for checking invariants.
    #[cfg(test)]
    pub fn state_of(&self, combination: &Combination) -> Vec<&'static str> {
        let mut states = vec![];
        if self.remaining.contains(combination) {
            states.push("remaining");
        }
        if self.in_progress.contains(combination) {
            states.push("in_progress");
        }
        if self.completed.contains(combination) {
            states.push("completed");
        }
        if self.canceled.contains(combination) {
            states.push("canceled");
        }
        states
    }
}

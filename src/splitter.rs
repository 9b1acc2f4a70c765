//! Seeded train/valid/test partition of game indices.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::Path;

use crate::artifact::{self, ArtifactError};

/// Game indices per partition.
///
/// The three lists are pairwise disjoint and together cover `0..game_count`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    /// Training games.
    pub train: Vec<usize>,
    /// Validation games.
    pub valid: Vec<usize>,
    /// Test games.
    pub test: Vec<usize>,
}

impl PartitionAssignment {
    /// Partitions in output order with their file-name prefixes.
    pub fn partitions(&self) -> [(&'static str, &[usize]); 3] {
        [
            ("train", self.train.as_slice()),
            ("valid", self.valid.as_slice()),
            ("test", self.test.as_slice()),
        ]
    }

    /// Total games across all partitions.
    pub fn len(&self) -> usize {
        self.train.len() + self.valid.len() + self.test.len()
    }

    /// Whether no games were assigned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that the partitions exactly cover `0..game_count` without overlap.
    pub fn check_cover(&self, game_count: usize) -> Result<(), SplitError> {
        let mut seen = HashSet::with_capacity(self.len());
        for (_, indices) in self.partitions() {
            for &index in indices {
                if index >= game_count || !seen.insert(index) {
                    return Err(SplitError::Cover { game_count });
                }
            }
        }
        if seen.len() != game_count {
            return Err(SplitError::Cover { game_count });
        }
        Ok(())
    }

    /// Loads a partition file.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        artifact::read_json(path)
    }

    /// Writes the partition file.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        artifact::write_json_pretty(path, self)
    }
}

/// Shuffles `0..game_count` with `seed` and slices it by ratio.
///
/// The first `floor(train_ratio * n)` shuffled indices go to train, the next
/// `floor(valid_ratio * n)` to valid, and the rest to test. Identical
/// arguments always produce identical output.
pub fn split(
    game_count: usize,
    train_ratio: f64,
    valid_ratio: f64,
    seed: u64,
) -> Result<PartitionAssignment, SplitError> {
    for ratio in [train_ratio, valid_ratio] {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(SplitError::Ratio(ratio));
        }
    }
    if train_ratio + valid_ratio > 1.0 {
        return Err(SplitError::Ratio(train_ratio + valid_ratio));
    }

    let mut indices: Vec<usize> = (0..game_count).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let train_len = ((train_ratio * game_count as f64).floor() as usize).min(game_count);
    let valid_len = ((valid_ratio * game_count as f64).floor() as usize).min(game_count - train_len);

    let test = indices.split_off(train_len + valid_len);
    let valid = indices.split_off(train_len);
    Ok(PartitionAssignment {
        train: indices,
        valid,
        test,
    })
}

/// Errors from partitioning.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitError {
    /// A ratio, or the sum of ratios, fell outside `[0, 1]`.
    Ratio(f64),
    /// A loaded assignment does not exactly cover the games.
    Cover {
        /// Number of games expected.
        game_count: usize,
    },
}

impl fmt::Display for SplitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ratio(value) => write!(f, "split ratio {value} outside [0, 1]"),
            Self::Cover { game_count } => write!(
                f,
                "partitions do not cover games 0..{game_count} exactly once"
            ),
        }
    }
}

impl Error for SplitError {}

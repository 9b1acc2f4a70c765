//! Ordered game-id → page-count index and its JSON store.
//!
//! Insertion order is the stable game index used by every later stage: raw
//! page names, record files and partitions all refer to games by position.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::artifact::{self, ArtifactError, ErrorKind};

/// Append-only mapping from game identifier to its page count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkIndex {
    entries: Vec<(String, u32)>,
    positions: HashMap<String, usize>,
}

impl LinkIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of games.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no games have been discovered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `game_id` is already indexed.
    pub fn contains(&self, game_id: &str) -> bool {
        self.positions.contains_key(game_id)
    }

    /// Records a newly discovered game.
    ///
    /// Returns `false` and leaves the index untouched when the id is already
    /// present; page counts are fixed at discovery time.
    pub fn insert(&mut self, game_id: impl Into<String>, pages: u32) -> bool {
        let game_id = game_id.into();
        if self.positions.contains_key(&game_id) {
            return false;
        }
        self.positions.insert(game_id.clone(), self.entries.len());
        self.entries.push((game_id, pages.max(1)));
        true
    }

    /// Stable index of `game_id`.
    pub fn position(&self, game_id: &str) -> Option<usize> {
        self.positions.get(game_id).copied()
    }

    /// Game id and page count at `index`.
    pub fn get(&self, index: usize) -> Option<(&str, u32)> {
        self.entries
            .get(index)
            .map(|(id, pages)| (id.as_str(), *pages))
    }

    /// Entries in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.entries.iter().map(|(id, pages)| (id.as_str(), *pages))
    }

    /// Page counts in discovery order, addressable by game index.
    pub fn page_counts(&self) -> Vec<u32> {
        self.entries.iter().map(|(_, pages)| *pages).collect()
    }

    /// Sum of all page counts.
    pub fn total_pages(&self) -> u64 {
        self.entries.iter().map(|(_, pages)| u64::from(*pages)).sum()
    }
}

impl Serialize for LinkIndex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (id, pages) in &self.entries {
            map.serialize_entry(id, pages)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LinkIndex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IndexVisitor;

        impl<'de> Visitor<'de> for IndexVisitor {
            type Value = LinkIndex;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping game ids to page counts")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut index = LinkIndex::new();
                while let Some((id, pages)) = access.next_entry::<String, u32>()? {
                    if pages == 0 {
                        return Err(de::Error::custom(format!(
                            "game {id} has a page count of zero"
                        )));
                    }
                    index.insert(id, pages);
                }
                Ok(index)
            }
        }

        deserializer.deserialize_map(IndexVisitor)
    }
}

/// Location of the persisted [`LinkIndex`].
#[derive(Debug, Clone)]
pub struct LinkStore {
    path: PathBuf,
}

impl LinkStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the index; a missing file yields an empty index.
    pub fn load(&self) -> Result<LinkIndex, ArtifactError> {
        match artifact::read_json(&self.path) {
            Ok(index) => Ok(index),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(LinkIndex::new()),
            Err(err) => Err(err),
        }
    }

    /// Loads the index, treating a missing file as an error.
    pub fn load_existing(&self) -> Result<LinkIndex, ArtifactError> {
        artifact::read_json(&self.path)
    }

    /// Replaces the stored index.
    pub fn save(&self, index: &LinkIndex) -> Result<(), ArtifactError> {
        artifact::write_json_pretty(&self.path, index)
    }
}

//! Segmentation set table
//!
//! Each voxel of a downsampled segmentation lattice stores a small integer id
//! standing for the *set* of original-resolution labels found in the block
//! it covers. The table is a canonical dictionary: a given set of labels is
//! stored exactly once, so resolving an already-known set returns its id.
//!
//! Sets are kept as sorted, deduplicated label vectors in an ordered map keyed
//! by id, with a hash index from set to id for resolve-or-create. Ids may be
//! sparse: a level-1 table uses the raw label values as ids.

use crate::error::{Result, VolsegError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An original-resolution segment label.
pub type Label = u32;

/// A category id as stored in a lattice voxel.
pub type CategoryId = u32;

/// Id of the empty (background) set in every table.
pub const BACKGROUND_ID: CategoryId = 0;

/// Mapping from category id to a canonical set of labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<CategoryId, Vec<Label>>", try_from = "BTreeMap<CategoryId, Vec<Label>>")]
pub struct SetTable {
    sets: BTreeMap<CategoryId, Box<[Label]>>,
    index: HashMap<Box<[Label]>, CategoryId>,
}

impl SetTable {
    /// Create a table holding only the empty set under id 0.
    pub fn new() -> Self {
        let empty: Box<[Label]> = Box::new([]);
        let mut index = HashMap::new();
        index.insert(empty.clone(), BACKGROUND_ID);
        Self {
            sets: BTreeMap::from([(BACKGROUND_ID, empty)]),
            index,
        }
    }

    /// Table for a level-1 lattice: value 0 is background, every other value
    /// `v` denotes the singleton `{v}`.
    pub fn from_labels(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut table = Self::new();
        for label in labels {
            if label == BACKGROUND_ID || table.get(label).is_some() {
                continue;
            }
            let set: Box<[Label]> = Box::new([label]);
            table.index.insert(set.clone(), label);
            table.sets.insert(label, set);
        }
        table
    }

    /// Return the id of `candidate`, allocating the next unused id when the
    /// set is not yet known.
    ///
    /// `candidate` may be unsorted and contain duplicates. Fails once the id
    /// space above the highest allocated id is exhausted.
    pub fn resolve_category(&mut self, candidate: &[Label]) -> Result<CategoryId> {
        let mut set = candidate.to_vec();
        set.sort_unstable();
        set.dedup();
        self.resolve_canonical(set)
    }

    /// Like [`resolve_category`](Self::resolve_category) for a set that is
    /// already sorted and deduplicated.
    pub fn resolve_canonical(&mut self, set: Vec<Label>) -> Result<CategoryId> {
        debug_assert!(set.windows(2).all(|w| w[0] < w[1]));
        if let Some(&id) = self.index.get(set.as_slice()) {
            return Ok(id);
        }
        let id = self.next_id()?;
        let set = set.into_boxed_slice();
        self.index.insert(set.clone(), id);
        self.sets.insert(id, set);
        Ok(id)
    }

    /// One past the highest allocated id.
    fn next_id(&self) -> Result<CategoryId> {
        let highest = self.sets.keys().next_back().copied().unwrap_or(BACKGROUND_ID);
        highest.checked_add(1).ok_or_else(|| {
            VolsegError::Integrity(format!("no category id left above {highest}"))
        })
    }

    /// Look up an existing set without allocating.
    pub fn id_of(&self, candidate: &[Label]) -> Option<CategoryId> {
        let mut set = candidate.to_vec();
        set.sort_unstable();
        set.dedup();
        self.index.get(set.as_slice()).copied()
    }

    /// The set denoted by `id`.
    pub fn get(&self, id: CategoryId) -> Option<&[Label]> {
        self.sets.get(&id).map(|s| &**s)
    }

    /// One set per input id.
    pub fn get_categories(&self, values: &[CategoryId]) -> Result<Vec<&[Label]>> {
        values
            .iter()
            .map(|&v| self.get(v).ok_or(VolsegError::UnknownCategoryId(v)))
            .collect()
    }

    /// Number of registered sets, the empty set included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when only the empty set is registered.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Iterate `(id, set)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (CategoryId, &[Label])> + '_ {
        self.sets.iter().map(|(&id, set)| (id, &**set))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn insert_at(&mut self, id: CategoryId, set: Box<[Label]>) -> Result<()> {
        if let Some(&existing) = self.index.get(&set) {
            return Err(VolsegError::Integrity(format!(
                "set {:?} registered under both id {} and id {}",
                set, existing, id
            )));
        }
        if self.get(id).is_some() {
            return Err(VolsegError::Integrity(format!("id {id} registered twice")));
        }
        self.index.insert(set.clone(), id);
        self.sets.insert(id, set);
        Ok(())
    }
}

impl Default for SetTable {
    fn default() -> Self {
        Self::new()
    }
}

impl From<SetTable> for BTreeMap<CategoryId, Vec<Label>> {
    fn from(table: SetTable) -> Self {
        table.iter().map(|(id, set)| (id, set.to_vec())).collect()
    }
}

impl TryFrom<BTreeMap<CategoryId, Vec<Label>>> for SetTable {
    type Error = VolsegError;

    fn try_from(map: BTreeMap<CategoryId, Vec<Label>>) -> Result<Self> {
        let mut table = SetTable {
            sets: BTreeMap::new(),
            index: HashMap::new(),
        };
        for (id, mut set) in map {
            set.sort_unstable();
            set.dedup();
            if id == BACKGROUND_ID && !set.is_empty() {
                return Err(VolsegError::Integrity(format!(
                    "id 0 is reserved for the empty set, found {:?}",
                    set
                )));
            }
            table.insert_at(id, set.into_boxed_slice())?;
        }
        if table.get(BACKGROUND_ID).is_none() {
            table.insert_at(BACKGROUND_ID, Box::new([]))?;
        }
        Ok(table)
    }
}

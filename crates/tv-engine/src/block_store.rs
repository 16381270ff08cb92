#![forbid(unsafe_code)]

//! Sparse storage of leaf blocks keyed by partition coordinates.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tv_core::Value;

use crate::TreeError;
use crate::coords::{CoordinateIter, Coords};

/// Blocks of a structured value, one per coordinate tuple. Coordinates are
/// packed into a single row-major index over `extents` (the number of
/// partitions per axis).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStore {
    extents: SmallVec<[usize; 4]>,
    blocks: FxHashMap<usize, Value>,
}

impl BlockStore {
    #[must_use]
    pub fn new(extents: &[usize]) -> Self {
        Self {
            extents: SmallVec::from_slice(extents),
            blocks: FxHashMap::default(),
        }
    }

    /// Store holding one block at the zero coordinate of a `rank`-axis value.
    #[must_use]
    pub fn single(rank: usize, value: Value) -> Self {
        let mut store = Self::new(&vec![1; rank]);
        store.blocks.insert(0, value);
        store
    }

    #[must_use]
    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of coordinates in the full Cartesian product.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.extents.iter().product()
    }

    fn linear_index(&self, coords: &[usize]) -> Option<usize> {
        if coords.len() != self.extents.len() {
            return None;
        }
        let mut linear = 0;
        for (&coord, &extent) in coords.iter().zip(&self.extents) {
            if coord >= extent {
                return None;
            }
            linear = linear * extent + coord;
        }
        Some(linear)
    }

    fn out_of_range(&self, coords: &[usize]) -> TreeError {
        TreeError::InvalidStructure(format!(
            "coordinate {coords:?} outside block extents {:?}",
            self.extents.as_slice()
        ))
    }

    /// Inserts a block, returning the one it replaced.
    pub fn insert(&mut self, coords: &[usize], value: Value) -> Result<Option<Value>, TreeError> {
        let linear = self
            .linear_index(coords)
            .ok_or_else(|| self.out_of_range(coords))?;
        Ok(self.blocks.insert(linear, value))
    }

    #[must_use]
    pub fn get(&self, coords: &[usize]) -> Option<&Value> {
        self.linear_index(coords)
            .and_then(|linear| self.blocks.get(&linear))
    }

    /// Folds `value` into the block at `coords` with `combine`, or stores it
    /// if the slot is empty.
    pub fn accumulate(
        &mut self,
        coords: &[usize],
        value: Value,
        combine: impl FnOnce(Value, Value) -> Result<Value, TreeError>,
    ) -> Result<(), TreeError> {
        let linear = self
            .linear_index(coords)
            .ok_or_else(|| self.out_of_range(coords))?;
        let merged = match self.blocks.remove(&linear) {
            Some(existing) => combine(existing, value)?,
            None => value,
        };
        self.blocks.insert(linear, merged);
        Ok(())
    }

    /// Present blocks in row-major coordinate order.
    pub fn iter(&self) -> impl Iterator<Item = (Coords, &Value)> + '_ {
        CoordinateIter::new(&self.extents)
            .filter_map(move |coords| self.get(&coords).map(|value| (coords, value)))
    }

    /// Any one block; used to read the element type.
    #[must_use]
    pub fn first(&self) -> Option<&Value> {
        self.iter().next().map(|(_, value)| value)
    }
}

#![forbid(unsafe_code)]

use tv_core::{DType, Shape, Value};
use tv_tree::{ContainerShape, TreeDef};

use crate::TreeError;
use crate::block_store::BlockStore;
use crate::coords::{block_shape, iterate_coordinates, segments_length};

/// How one logical axis is partitioned: an optional nesting descriptor and
/// the physical sub-shape contributed by each partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AxisStructure<D = TreeDef> {
    container: D,
    segments: Vec<Shape>,
}

impl<D: ContainerShape> AxisStructure<D> {
    /// Fails unless the descriptor's leaf count matches the segment count.
    pub fn new(container: D, segments: Vec<Shape>) -> Result<Self, TreeError> {
        if container.leaf_count() != segments.len() {
            return Err(TreeError::InvalidStructure(format!(
                "container {container:?} has {} leaves but {} segments were given",
                container.leaf_count(),
                segments.len()
            )));
        }
        Ok(Self {
            container,
            segments,
        })
    }

    /// Plain axis of `len` elements with no nesting.
    #[must_use]
    pub fn trivial(len: u32) -> Self {
        Self {
            container: D::trivial(),
            segments: vec![Shape::vector(len)],
        }
    }

    /// Unnested axis made of one segment of arbitrary rank.
    #[must_use]
    pub fn single(segment: Shape) -> Self {
        Self {
            container: D::trivial(),
            segments: vec![segment],
        }
    }

    #[must_use]
    pub fn container(&self) -> &D {
        &self.container
    }

    #[must_use]
    pub fn segments(&self) -> &[Shape] {
        &self.segments
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.segments.len()
    }

    /// No nesting and a single 1-D segment.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.container.is_trivial() && self.is_flat()
    }

    /// A single 1-D segment, whatever the container.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        matches!(self.segments.as_slice(), [only] if only.rank() == 1)
    }

    /// More or fewer than one segment.
    #[must_use]
    pub fn is_partitioned(&self) -> bool {
        self.segments.len() != 1
    }

    #[must_use]
    pub fn axis_length(&self) -> u64 {
        segments_length(&self.segments)
    }
}

impl<D> AsRef<[Shape]> for AxisStructure<D> {
    fn as_ref(&self) -> &[Shape] {
        &self.segments
    }
}

/// A logical array whose axes may be partitioned into irregular leaves.
///
/// Immutable once built; [`StructuredValue::new`] checks that every
/// coordinate has a block of the right physical shape and that all blocks
/// share one dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredValue<D = TreeDef> {
    axes: Vec<AxisStructure<D>>,
    blocks: BlockStore,
    dtype: DType,
    shape: Shape,
}

impl<D: ContainerShape> StructuredValue<D> {
    pub fn new(axes: Vec<AxisStructure<D>>, blocks: BlockStore) -> Result<Self, TreeError> {
        let extents = axes
            .iter()
            .map(AxisStructure::leaf_count)
            .collect::<Vec<_>>();
        if blocks.extents() != extents.as_slice() {
            return Err(TreeError::InvalidStructure(format!(
                "block extents {:?} do not match axis leaf counts {extents:?}",
                blocks.extents()
            )));
        }
        let dims = axes
            .iter()
            .enumerate()
            .map(|(axis, structure)| {
                let length = structure.axis_length();
                u32::try_from(length).map_err(|_| {
                    TreeError::InvalidStructure(format!(
                        "axis {axis} length {length} exceeds the supported dimension size"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let dtype = blocks
            .first()
            .map(Value::dtype)
            .ok_or_else(|| TreeError::InvalidStructure("no blocks".to_owned()))?;

        for coords in iterate_coordinates(&axes) {
            let block = blocks.get(&coords).ok_or_else(|| {
                TreeError::InvalidStructure(format!("missing block at {:?}", coords.as_slice()))
            })?;
            let expected = block_shape(&axes, &coords)?;
            if block.shape() != expected {
                return Err(TreeError::InvalidStructure(format!(
                    "block at {:?} has shape {}, expected {expected}",
                    coords.as_slice(),
                    block.shape()
                )));
            }
            if block.dtype() != dtype {
                return Err(TreeError::InvalidStructure(format!(
                    "block at {:?} has dtype {}, expected {}",
                    coords.as_slice(),
                    block.dtype().as_str(),
                    dtype.as_str()
                )));
            }
        }

        Ok(Self {
            axes,
            blocks,
            dtype,
            shape: Shape::new(dims),
        })
    }

    #[must_use]
    pub fn axes(&self) -> &[AxisStructure<D>] {
        &self.axes
    }

    #[must_use]
    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    #[must_use]
    pub fn block(&self, coords: &[usize]) -> Option<&Value> {
        self.blocks.get(coords)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Logical shape: one axis length per axis.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn is_fully_trivial(&self) -> bool {
        self.axes.iter().all(AxisStructure::is_trivial) && self.blocks.len() == 1
    }

    /// The single plain array of a fully trivial value.
    #[must_use]
    pub fn lower(&self) -> Option<&Value> {
        if self.is_fully_trivial() {
            self.blocks.first()
        } else {
            None
        }
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<AxisStructure<D>>, BlockStore) {
        (self.axes, self.blocks)
    }
}

#![forbid(unsafe_code)]

//! Coordinate enumeration and the mapping from logical axes to physical
//! block dimensions.

use log::trace;
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeMap;
use tv_core::{Primitive, Shape};
use tv_lax::format_usize_list;

use crate::block_store::BlockStore;
use crate::{TreeError, run_kernel};

/// One partition index per logical axis.
pub type Coords = SmallVec<[usize; 4]>;

/// Row-major (first axis slowest) walk over the Cartesian product of
/// `0..extent` per axis. A rank-0 product yields exactly one empty tuple;
/// any zero extent yields nothing.
#[derive(Debug, Clone)]
pub struct CoordinateIter {
    extents: SmallVec<[usize; 4]>,
    next: Option<Coords>,
}

impl CoordinateIter {
    #[must_use]
    pub fn new(extents: &[usize]) -> Self {
        let next = if extents.contains(&0) {
            None
        } else {
            Some(smallvec![0; extents.len()])
        };
        Self {
            extents: SmallVec::from_slice(extents),
            next,
        }
    }
}

impl Iterator for CoordinateIter {
    type Item = Coords;

    fn next(&mut self) -> Option<Coords> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        for axis in (0..self.extents.len()).rev() {
            advanced[axis] += 1;
            if advanced[axis] < self.extents[axis] {
                self.next = Some(advanced);
                return Some(current);
            }
            advanced[axis] = 0;
        }
        Some(current)
    }
}

/// Coordinates of every block of a value laid out as `layout` (one segment
/// list per axis).
pub fn iterate_coordinates<S: AsRef<[Shape]>>(layout: &[S]) -> CoordinateIter {
    let extents = layout
        .iter()
        .map(|axis| axis.as_ref().len())
        .collect::<SmallVec<[usize; 4]>>();
    CoordinateIter::new(&extents)
}

/// Segment of `layout` at `coords`, one per axis.
fn segments_at<'a, S: AsRef<[Shape]>>(
    layout: &'a [S],
    coords: &[usize],
) -> Result<SmallVec<[&'a Shape; 8]>, TreeError> {
    if coords.len() != layout.len() {
        return Err(TreeError::InvalidStructure(format!(
            "coordinate {coords:?} does not match rank {}",
            layout.len()
        )));
    }
    layout
        .iter()
        .zip(coords)
        .map(|(axis, &coord)| {
            axis.as_ref().get(coord).ok_or_else(|| {
                TreeError::InvalidStructure(format!(
                    "coordinate {coords:?} outside the axis partitions"
                ))
            })
        })
        .collect()
}

/// Physical block dimensions occupied by `targets`, in the order the targets
/// are listed. Each axis contributes as many dimensions as its segment at
/// `coords` has.
pub fn physical_subaxis_range<S: AsRef<[Shape]>>(
    layout: &[S],
    coords: &[usize],
    targets: &[usize],
) -> Result<SmallVec<[usize; 8]>, TreeError> {
    let segments = segments_at(layout, coords)?;
    let mut starts = SmallVec::<[usize; 8]>::with_capacity(segments.len());
    let mut offset = 0;
    for segment in &segments {
        starts.push(offset);
        offset += segment.rank();
    }
    let mut physical = SmallVec::<[usize; 8]>::new();
    for &axis in targets {
        let (start, segment) = starts
            .get(axis)
            .zip(segments.get(axis))
            .ok_or_else(|| TreeError::InvalidParam {
                key: "axes".to_owned(),
                detail: format!("axis {axis} out of range for rank {}", layout.len()),
            })?;
        physical.extend(*start..*start + segment.rank());
    }
    Ok(physical)
}

/// Physical shape of the block at `coords`.
pub fn block_shape<S: AsRef<[Shape]>>(
    layout: &[S],
    coords: &[usize],
) -> Result<Shape, TreeError> {
    Ok(Shape::concat(segments_at(layout, coords)?))
}

/// Total number of elements along an axis laid out as `segments`.
#[must_use]
pub fn segments_length(segments: &[Shape]) -> u64 {
    segments
        .iter()
        .map(|segment| segment.element_count().unwrap_or(u64::MAX))
        .fold(0, u64::saturating_add)
}

/// Re-partitions `axis` of every block into `target_segments`.
///
/// The axis must currently be a single 1-D segment whose extent equals the
/// combined length of the targets. Each block is sliced along the matching
/// physical dimension and each piece is reshaped to its target segment.
pub fn split_along_axis<S: AsRef<[Shape]>>(
    layout: &[S],
    blocks: &BlockStore,
    axis: usize,
    target_segments: &[Shape],
) -> Result<BlockStore, TreeError> {
    let segments: &[Shape] = layout
        .get(axis)
        .map(|structure| structure.as_ref())
        .ok_or_else(|| TreeError::InvalidParam {
            key: "axis".to_owned(),
            detail: format!("axis {axis} out of range for rank {}", layout.len()),
        })?;
    let extent = match segments {
        [only] if only.rank() == 1 => u64::from(only.dims[0]),
        _ => {
            return Err(TreeError::ConflictingShape {
                axis,
                detail: format!("cannot split layout {segments:?}; expected a single 1-D segment"),
            });
        }
    };
    let wanted = segments_length(target_segments);
    if wanted != extent {
        return Err(TreeError::ShapeMismatch {
            axis,
            expected: wanted,
            actual: extent,
        });
    }

    trace!(
        "split axis {axis} of length {extent} into {} segments",
        target_segments.len()
    );

    if blocks.rank() != layout.len() {
        return Err(TreeError::InvalidStructure(format!(
            "blocks of rank {} do not match a layout of rank {}",
            blocks.rank(),
            layout.len()
        )));
    }
    let mut extents = blocks.extents().to_vec();
    extents[axis] = target_segments.len();
    let mut out = BlockStore::new(&extents);

    for coords in iterate_coordinates(layout) {
        let block = blocks.get(&coords).ok_or_else(|| {
            TreeError::InvalidStructure(format!("missing block at {:?}", coords.as_slice()))
        })?;
        let shape = block.shape();
        let physical = physical_subaxis_range(layout, &coords, &[axis])?[0];

        let mut offset = 0_usize;
        for (index, segment) in target_segments.iter().enumerate() {
            let len = segment.element_count().unwrap_or(0) as usize;
            let mut start = vec![0; shape.rank()];
            let mut limit = shape
                .dims
                .iter()
                .map(|&dim| dim as usize)
                .collect::<Vec<_>>();
            start[physical] = offset;
            limit[physical] = offset + len;
            let piece = run_kernel(
                Primitive::Slice,
                std::slice::from_ref(block),
                &BTreeMap::from([
                    ("start_indices".to_owned(), format_usize_list(&start)),
                    ("limit_indices".to_owned(), format_usize_list(&limit)),
                ]),
            )?;

            let new_dims = shape.dims[..physical]
                .iter()
                .chain(&segment.dims)
                .chain(&shape.dims[physical + 1..])
                .map(|&dim| dim as usize)
                .collect::<Vec<_>>();
            let piece = run_kernel(
                Primitive::Reshape,
                &[piece],
                &BTreeMap::from([("new_shape".to_owned(), format_usize_list(&new_dims))]),
            )?;

            let mut out_coords = coords.clone();
            out_coords[axis] = index;
            out.insert(&out_coords, piece)?;
            offset += len;
        }
    }
    Ok(out)
}

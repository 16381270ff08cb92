#![forbid(unsafe_code)]

//! Broadcasting n-ary rule.
//!
//! Rank-0 operands are set aside and re-inserted positionally for every
//! block. The remaining operands must share a rank; each axis is reconciled
//! independently:
//!
//! * at most one distinct non-trivial container may appear,
//! * at most one distinct partitioned layout may appear and, if present, it
//!   becomes the result layout,
//! * otherwise lengths must be 1 or the common maximum, and the layout is the
//!   one shared by the full-length operands (or a flat segment when they
//!   disagree).
//!
//! Full-length operands whose layout differs are split into the result
//! layout. Length-1 operands are broadcast: their physical dims for that axis
//! are squeezed out and size-1 dims are inserted where the result layout
//! expects them.

use log::trace;
use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::BTreeMap;
use tv_core::{Primitive, Shape, Value};
use tv_lax::format_usize_list;
use tv_tree::ContainerShape;

use super::{
    RuleOutput, common_container, common_partitioned_layout, common_rank, finish_axis,
    flat_segment, shared_full_length_layout,
};
use crate::block_store::BlockStore;
use crate::coords::{Coords, iterate_coordinates, physical_subaxis_range, split_along_axis};
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

enum Slot<'a, D> {
    Scalar(&'a Value),
    Shaped(&'a StructuredValue<D>),
}

/// An operand aligned to the result layout.
struct Aligned<'a> {
    layout: Vec<Vec<Shape>>,
    blocks: Cow<'a, BlockStore>,
    /// Axes where this operand is broadcast from length 1.
    broadcast: SmallVec<[usize; 4]>,
}

pub(crate) fn nary_rule<D: ContainerShape>(
    primitive: Primitive,
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    if operands.is_empty() {
        return Err(TreeError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    }

    let mut slots = Vec::with_capacity(operands.len());
    for operand in operands {
        if operand.rank() == 0 {
            let value = operand.block(&[]).ok_or_else(|| {
                TreeError::InvalidStructure("rank-0 operand without a block".to_owned())
            })?;
            slots.push(Slot::Scalar(value));
        } else {
            slots.push(Slot::Shaped(operand));
        }
    }
    let shaped = slots
        .iter()
        .filter_map(|slot| match slot {
            Slot::Shaped(operand) => Some(*operand),
            Slot::Scalar(_) => None,
        })
        .collect::<Vec<_>>();

    if shaped.is_empty() {
        let inputs = operands
            .iter()
            .filter_map(|operand| operand.block(&[]).cloned())
            .collect::<Vec<_>>();
        let out = run_kernel(primitive, &inputs, params)?;
        return Ok((Vec::new(), BlockStore::single(0, out)));
    }

    let rank = common_rank(primitive, &shaped)?;
    let out_axes = (0..rank)
        .map(|axis| {
            let column = shaped
                .iter()
                .map(|operand| &operand.axes()[axis])
                .collect::<Vec<_>>();
            reconcile_axis(axis, &column)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let aligned = shaped
        .iter()
        .map(|operand| align(operand, &out_axes))
        .collect::<Result<Vec<_>, _>>()?;

    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    for out_coords in iterate_coordinates(&out_axes) {
        let mut shaped_args = aligned
            .iter()
            .map(|operand| broadcast_block(operand, &out_axes, &out_coords))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();
        let mut inputs = Vec::with_capacity(slots.len());
        for slot in &slots {
            match slot {
                Slot::Scalar(value) => inputs.push((*value).clone()),
                Slot::Shaped(_) => inputs.extend(shaped_args.next()),
            }
        }
        out.insert(&out_coords, run_kernel(primitive, &inputs, params)?)?;
    }
    Ok((out_axes, out))
}

fn reconcile_axis<D: ContainerShape>(
    axis: usize,
    column: &[&AxisStructure<D>],
) -> Result<AxisStructure<D>, TreeError> {
    let container = common_container(axis, column)?;
    let segments = match common_partitioned_layout(axis, column)? {
        Some(layout) => layout,
        None => {
            let size = column
                .iter()
                .map(|a| a.axis_length())
                .max()
                .unwrap_or(1);
            if let Some(bad) = column
                .iter()
                .map(|a| a.axis_length())
                .find(|&len| len != 1 && len != size)
            {
                return Err(TreeError::ShapeMismatch {
                    axis,
                    expected: size,
                    actual: bad,
                });
            }
            match shared_full_length_layout(column, size) {
                Some(layout) => layout,
                None if size == 1 => column
                    .iter()
                    .find(|a| !a.container().is_trivial())
                    .map_or_else(|| vec![Shape::vector(1)], |a| a.segments().to_vec()),
                None => flat_segment(axis, size)?,
            }
        }
    };
    finish_axis(axis, container, segments)
}

fn align<'a, D: ContainerShape>(
    operand: &'a StructuredValue<D>,
    out_axes: &[AxisStructure<D>],
) -> Result<Aligned<'a>, TreeError> {
    let mut layout = operand
        .axes()
        .iter()
        .map(|a| a.segments().to_vec())
        .collect::<Vec<_>>();
    let mut blocks = Cow::Borrowed(operand.blocks());
    let mut broadcast = SmallVec::new();
    for (axis, (operand_axis, out_axis)) in operand.axes().iter().zip(out_axes).enumerate() {
        if layout[axis] == out_axis.segments() {
            continue;
        }
        if operand_axis.axis_length() == 1 {
            broadcast.push(axis);
            continue;
        }
        let split = split_along_axis(&layout, &blocks, axis, out_axis.segments())?;
        blocks = Cow::Owned(split);
        layout[axis] = out_axis.segments().to_vec();
    }
    if !broadcast.is_empty() {
        trace!("broadcasting operand along axes {:?}", broadcast.as_slice());
    }
    Ok(Aligned {
        layout,
        blocks,
        broadcast,
    })
}

/// Block of `operand` feeding the result block at `out_coords`, reshaped so
/// its broadcast axes occupy size-1 dims at the result's physical positions.
fn broadcast_block<D: ContainerShape>(
    operand: &Aligned<'_>,
    out_axes: &[AxisStructure<D>],
    out_coords: &[usize],
) -> Result<Value, TreeError> {
    let mut in_coords = Coords::from_slice(out_coords);
    for &axis in &operand.broadcast {
        in_coords[axis] = 0;
    }
    let block = operand.blocks.get(&in_coords).ok_or_else(|| {
        TreeError::InvalidStructure(format!("missing block at {:?}", in_coords.as_slice()))
    })?;
    if operand.broadcast.is_empty() {
        return Ok(block.clone());
    }

    let remove = physical_subaxis_range(&operand.layout, &in_coords, &operand.broadcast)?;
    let insert = physical_subaxis_range(out_axes, out_coords, &operand.broadcast)?;
    let mut block = block.clone();
    if !remove.is_empty() {
        block = run_kernel(
            Primitive::Squeeze,
            &[block],
            &BTreeMap::from([("dimensions".to_owned(), format_usize_list(&remove))]),
        )?;
    }
    if !insert.is_empty() {
        block = run_kernel(
            Primitive::ExpandDims,
            &[block],
            &BTreeMap::from([("dimensions".to_owned(), format_usize_list(&insert))]),
        )?;
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::nary_rule;
    use crate::structure::{AxisStructure, StructuredValue};
    use crate::{BlockStore, TreeError, convert_leaf};
    use std::collections::BTreeMap;
    use tv_core::{Primitive, Shape, Value};
    use tv_tree::TreeDef;

    fn dict(keys: &[&str]) -> TreeDef {
        TreeDef::Dict(
            keys.iter()
                .map(|k| ((*k).to_owned(), TreeDef::Leaf))
                .collect(),
        )
    }

    /// Rank-1 value over `def` with one 1-D segment per leaf.
    fn partitioned(def: TreeDef, leaves: &[&[i64]]) -> StructuredValue {
        let segments = leaves
            .iter()
            .map(|leaf| Shape::vector(leaf.len() as u32))
            .collect();
        let axis = AxisStructure::new(def, segments).expect("axis");
        let mut blocks = BlockStore::new(&[leaves.len()]);
        for (i, leaf) in leaves.iter().enumerate() {
            blocks
                .insert(&[i], Value::vector_i64(leaf).expect("leaf"))
                .expect("insert");
        }
        StructuredValue::new(vec![axis], blocks).expect("value")
    }

    fn plain(values: &[i64]) -> StructuredValue {
        convert_leaf(Value::vector_i64(values).expect("v")).expect("leaf")
    }

    fn apply(primitive: Primitive, operands: &[StructuredValue]) -> Result<StructuredValue, TreeError> {
        let (axes, blocks) = nary_rule(primitive, operands, &BTreeMap::new())?;
        StructuredValue::new(axes, blocks)
    }

    #[test]
    fn plain_operand_is_split_into_partitions() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2, 3]]);
        let out = apply(Primitive::Add, &[x.clone(), plain(&[10, 20, 30])]).expect("add");
        assert_eq!(out.axes(), x.axes());
        assert_eq!(out.block(&[0]), Some(&Value::vector_i64(&[11]).expect("v")));
        assert_eq!(
            out.block(&[1]),
            Some(&Value::vector_i64(&[22, 33]).expect("v"))
        );
    }

    #[test]
    fn length_one_operand_broadcasts_across_partitions() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2, 3]]);
        let out = apply(Primitive::Mul, &[plain(&[2]), x]).expect("mul");
        assert_eq!(out.block(&[0]), Some(&Value::vector_i64(&[2]).expect("v")));
        assert_eq!(out.block(&[1]), Some(&Value::vector_i64(&[4, 6]).expect("v")));
    }

    #[test]
    fn scalars_are_reinserted_in_position() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2, 3]]);
        let ten = convert_leaf::<TreeDef>(Value::scalar_i64(10)).expect("scalar");
        let out = apply(Primitive::Sub, &[ten, x]).expect("sub");
        assert_eq!(out.block(&[0]), Some(&Value::vector_i64(&[9]).expect("v")));
        assert_eq!(out.block(&[1]), Some(&Value::vector_i64(&[8, 7]).expect("v")));
    }

    #[test]
    fn all_scalars_evaluate_once() {
        let a = convert_leaf::<TreeDef>(Value::scalar_i64(2)).expect("a");
        let b = convert_leaf::<TreeDef>(Value::scalar_i64(3)).expect("b");
        let out = apply(Primitive::Mul, &[a, b]).expect("mul");
        assert_eq!(out.rank(), 0);
        assert_eq!(out.block(&[]), Some(&Value::scalar_i64(6)));
    }

    #[test]
    fn conflicting_containers_fail() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2]]);
        let y = partitioned(dict(&["c", "d"]), &[&[1], &[2]]);
        let err = apply(Primitive::Add, &[x, y]).expect_err("conflict");
        assert!(matches!(err, TreeError::ConflictingStructure { axis: 0, .. }));
    }

    #[test]
    fn conflicting_partitions_fail() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2, 3]]);
        let y = partitioned(dict(&["a", "b"]), &[&[1, 2], &[3]]);
        let err = apply(Primitive::Add, &[x, y]).expect_err("conflict");
        assert!(matches!(err, TreeError::ConflictingShape { axis: 0, .. }));
    }

    #[test]
    fn incompatible_lengths_fail() {
        let err = apply(Primitive::Add, &[plain(&[1, 2]), plain(&[1, 2, 3])])
            .expect_err("mismatch");
        assert_eq!(
            err,
            TreeError::ShapeMismatch {
                axis: 0,
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn partitioned_layout_against_wrong_length_fails() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2, 3]]);
        let err = apply(Primitive::Add, &[x, plain(&[1, 2])]).expect_err("mismatch");
        assert!(matches!(err, TreeError::ShapeMismatch { axis: 0, .. }));
    }

    #[test]
    fn select_mixes_bool_and_numeric_operands() {
        let x = partitioned(dict(&["a", "b"]), &[&[1], &[2, 3]]);
        let zero = convert_leaf::<TreeDef>(Value::scalar_i64(0)).expect("zero");
        let (axes, blocks) =
            nary_rule(Primitive::Gt, &[x.clone(), zero.clone()], &BTreeMap::new()).expect("gt");
        let mask = StructuredValue::new(axes, blocks).expect("mask");
        let out = apply(Primitive::Select, &[mask, x, zero]).expect("select");
        assert_eq!(out.block(&[1]), Some(&Value::vector_i64(&[2, 3]).expect("v")));
    }

    #[test]
    fn rank_mismatch_fails() {
        let a = convert_leaf::<TreeDef>(Value::tensor_i64(&[1, 2], &[1, 2]).expect("a"))
            .expect("a");
        let err = apply(Primitive::Add, &[a, plain(&[1, 2])]).expect_err("rank");
        assert!(matches!(err, TreeError::RankMismatch { expected: 2, actual: 1, .. }));
    }
}

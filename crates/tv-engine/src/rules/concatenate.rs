#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use tv_core::Primitive;
use tv_tree::ContainerShape;

use super::{
    RuleOutput, block_params, common_container, common_partitioned_layout, common_rank,
    finish_axis, flat_segment, shared_full_length_layout, single_usize_param,
};
use crate::block_store::BlockStore;
use crate::coords::{iterate_coordinates, physical_subaxis_range, split_along_axis};
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

/// Concatenation along `dimension`, which must be a plain 1-D axis on every
/// operand; the result axis is flat with the summed length. Every other axis
/// must agree in length and is reconciled like an n-ary axis.
pub(crate) fn concatenate_rule<D: ContainerShape>(
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    let primitive = Primitive::Concatenate;
    if operands.is_empty() {
        return Err(TreeError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    }
    let dimension = single_usize_param(params, "dimension")?;
    let refs = operands.iter().collect::<Vec<_>>();
    let rank = common_rank(primitive, &refs)?;
    if dimension >= rank {
        return Err(TreeError::InvalidParam {
            key: "dimension".to_owned(),
            detail: format!("dimension {dimension} out of range for rank {rank}"),
        });
    }

    let mut out_axes = Vec::with_capacity(rank);
    for axis in 0..rank {
        let column = operands
            .iter()
            .map(|operand| &operand.axes()[axis])
            .collect::<Vec<_>>();
        if axis == dimension {
            out_axes.push(concat_axis(axis, &column)?);
        } else {
            out_axes.push(aligned_axis(axis, &column)?);
        }
    }

    let mut aligned = Vec::with_capacity(operands.len());
    for operand in operands {
        let mut layout = operand
            .axes()
            .iter()
            .map(|a| a.segments().to_vec())
            .collect::<Vec<_>>();
        let mut blocks = Cow::Borrowed(operand.blocks());
        for (axis, out_axis) in out_axes.iter().enumerate() {
            if axis == dimension || layout[axis] == out_axis.segments() {
                continue;
            }
            blocks = Cow::Owned(split_along_axis(
                &layout,
                &blocks,
                axis,
                out_axis.segments(),
            )?);
            layout[axis] = out_axis.segments().to_vec();
        }
        aligned.push(blocks);
    }

    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    for coords in iterate_coordinates(&out_axes) {
        let inputs = aligned
            .iter()
            .map(|blocks| {
                blocks.get(&coords).cloned().ok_or_else(|| {
                    TreeError::InvalidStructure(format!(
                        "missing block at {:?}",
                        coords.as_slice()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let physical = physical_subaxis_range(&out_axes, &coords, &[dimension])?;
        let leaf_dimension = physical.first().ok_or_else(|| TreeError::InvalidConcatenateAxis {
            axis: dimension,
            detail: "axis has no physical dimension".to_owned(),
        })?;
        let leaf_params = block_params(params, [("dimension", leaf_dimension.to_string())]);
        out.insert(&coords, run_kernel(primitive, &inputs, &leaf_params)?)?;
    }
    Ok((out_axes, out))
}

fn concat_axis<D: ContainerShape>(
    axis: usize,
    column: &[&AxisStructure<D>],
) -> Result<AxisStructure<D>, TreeError> {
    for operand_axis in column {
        if !operand_axis.container().is_trivial() {
            return Err(TreeError::InvalidConcatenateAxis {
                axis,
                detail: format!("axis carries container {:?}", operand_axis.container()),
            });
        }
        if !operand_axis.is_flat() {
            return Err(TreeError::InvalidConcatenateAxis {
                axis,
                detail: format!(
                    "layout {:?} is not a single 1-D segment",
                    operand_axis.segments()
                ),
            });
        }
    }
    let total = column.iter().map(|a| a.axis_length()).sum();
    finish_axis(axis, D::trivial(), flat_segment(axis, total)?)
}

fn aligned_axis<D: ContainerShape>(
    axis: usize,
    column: &[&AxisStructure<D>],
) -> Result<AxisStructure<D>, TreeError> {
    let container = common_container(axis, column)?;
    let length = column.first().map_or(0, |a| a.axis_length());
    if let Some(bad) = column
        .iter()
        .map(|a| a.axis_length())
        .find(|&len| len != length)
    {
        return Err(TreeError::ShapeMismatch {
            axis,
            expected: length,
            actual: bad,
        });
    }
    let segments = match common_partitioned_layout(axis, column)? {
        Some(layout) => layout,
        None => match shared_full_length_layout(column, length) {
            Some(layout) => layout,
            None => flat_segment(axis, length)?,
        },
    };
    finish_axis(axis, container, segments)
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::{Primitive, Shape};
use tv_lax::format_usize_list;
use tv_tree::ContainerShape;

use super::{RuleOutput, block_params, check_axes, expect_arity, flat_segment, usize_list_param};
use crate::block_store::BlockStore;
use crate::coords::{Coords, block_shape, physical_subaxis_range};
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

/// `broadcast_in_dim` with params `shape` and `broadcast_dimensions`.
///
/// Operand axis `k` lands on output axis `broadcast_dimensions[k]`. A mapped
/// axis with structure keeps it and must keep its length; a plain mapped axis
/// may broadcast from length 1. Unmapped output axes are plain.
pub(crate) fn broadcast_in_dim_rule<D: ContainerShape>(
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    let primitive = Primitive::BroadcastInDim;
    expect_arity(primitive, operands, 1)?;
    let operand = &operands[0];
    let shape = usize_list_param(params, "shape")?;
    let mapping = usize_list_param(params, "broadcast_dimensions")?;

    if mapping.len() != operand.rank() {
        return Err(TreeError::RankMismatch {
            primitive,
            expected: mapping.len(),
            actual: operand.rank(),
        });
    }
    if mapping.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(TreeError::InvalidParam {
            key: "broadcast_dimensions".to_owned(),
            detail: format!("{mapping:?} is not strictly increasing"),
        });
    }
    check_axes("broadcast_dimensions", &mapping, shape.len())?;

    let mut out_axes = shape
        .iter()
        .enumerate()
        .map(|(axis, &len)| {
            let segments = flat_segment(axis, len as u64)?;
            AxisStructure::new(D::trivial(), segments)
        })
        .collect::<Result<Vec<_>, _>>()?;
    for (in_axis, (&out_axis, operand_axis)) in mapping.iter().zip(operand.axes()).enumerate() {
        let target = shape[out_axis] as u64;
        let length = operand_axis.axis_length();
        if operand_axis.is_trivial() {
            if length != 1 && length != target {
                return Err(TreeError::ShapeMismatch {
                    axis: in_axis,
                    expected: target,
                    actual: length,
                });
            }
        } else {
            if length != target {
                return Err(TreeError::InvalidBroadcastAxis {
                    axis: in_axis,
                    detail: format!(
                        "structured axis of length {length} cannot become length {target}"
                    ),
                });
            }
            out_axes[out_axis] = operand_axis.clone();
        }
    }

    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    for (in_coords, block) in operand.blocks().iter() {
        let mut out_coords: Coords = Coords::from_elem(0, out_axes.len());
        for (&out_axis, &coord) in mapping.iter().zip(&in_coords) {
            out_coords[out_axis] = coord;
        }
        let leaf_shape = block_shape(&out_axes, &out_coords)?;
        let leaf_mapping = physical_subaxis_range(&out_axes, &out_coords, &mapping)?;
        let leaf_params = block_params(
            params,
            [
                ("shape", shape_param(&leaf_shape)),
                ("broadcast_dimensions", format_usize_list(&leaf_mapping)),
            ],
        );
        let expanded = run_kernel(primitive, std::slice::from_ref(block), &leaf_params)?;
        out.insert(&out_coords, expanded)?;
    }
    Ok((out_axes, out))
}

/// `expand_dims` with param `dimensions`, the positions of the new unit axes
/// in the output.
pub(crate) fn expand_dims_rule<D: ContainerShape>(
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    let primitive = Primitive::ExpandDims;
    expect_arity(primitive, operands, 1)?;
    let operand = &operands[0];
    let dims = usize_list_param(params, "dimensions")?;
    let out_rank = operand.rank() + dims.len();
    check_axes("dimensions", &dims, out_rank)?;

    let mut source = operand.axes().iter();
    let mut out_axes = Vec::with_capacity(out_rank);
    for axis in 0..out_rank {
        if dims.contains(&axis) {
            out_axes.push(AxisStructure::trivial(1));
        } else if let Some(kept) = source.next() {
            out_axes.push(kept.clone());
        }
    }

    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    for (in_coords, block) in operand.blocks().iter() {
        let mut source = in_coords.iter().copied();
        let out_coords = (0..out_rank)
            .map(|axis| {
                if dims.contains(&axis) {
                    0
                } else {
                    source.next().unwrap_or(0)
                }
            })
            .collect::<Coords>();
        let physical = physical_subaxis_range(&out_axes, &out_coords, &dims)?;
        let leaf_params = block_params(params, [("dimensions", format_usize_list(&physical))]);
        let expanded = run_kernel(primitive, std::slice::from_ref(block), &leaf_params)?;
        out.insert(&out_coords, expanded)?;
    }
    Ok((out_axes, out))
}

fn shape_param(shape: &Shape) -> String {
    let dims = shape
        .dims
        .iter()
        .map(|&dim| dim as usize)
        .collect::<Vec<_>>();
    format_usize_list(&dims)
}

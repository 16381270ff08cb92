#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::Primitive;
use tv_lax::format_usize_list;
use tv_tree::ContainerShape;

use super::{
    RuleOutput, block_params, check_axes, expect_arity, optional_usize_list_param,
};
use crate::block_store::BlockStore;
use crate::coords::{Coords, physical_subaxis_range};
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

/// Reduces every block over the physical dims of the reduced axes, then folds
/// blocks that land on the same output coordinate with `combiner`.
///
/// A missing `axes` param reduces every axis.
pub(crate) fn reduce_rule<D: ContainerShape>(
    primitive: Primitive,
    combiner: Primitive,
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    expect_arity(primitive, operands, 1)?;
    let operand = &operands[0];
    let axes = optional_usize_list_param(params, "axes")?
        .unwrap_or_else(|| (0..operand.rank()).collect());
    check_axes("axes", &axes, operand.rank())?;

    let out_axes = operand
        .axes()
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, structure)| structure.clone())
        .collect::<Vec<_>>();
    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    let no_params = BTreeMap::new();

    for (coords, block) in operand.blocks().iter() {
        let physical = physical_subaxis_range(operand.axes(), &coords, &axes)?;
        let leaf_params = block_params(params, [("axes", format_usize_list(&physical))]);
        let reduced = run_kernel(primitive, std::slice::from_ref(block), &leaf_params)?;
        let out_coords = coords
            .iter()
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(_, &coord)| coord)
            .collect::<Coords>();
        out.accumulate(&out_coords, reduced, |acc, next| {
            run_kernel(combiner, &[acc, next], &no_params)
        })?;
    }
    Ok((out_axes, out))
}

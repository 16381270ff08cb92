#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::Primitive;
use tv_lax::format_usize_list;
use tv_tree::ContainerShape;

use super::{RuleOutput, block_params, check_axes, expect_arity, usize_list_param};
use crate::block_store::BlockStore;
use crate::coords::{Coords, physical_subaxis_range};
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

/// Removes `dimensions`; each must be an unnested single-segment axis of
/// length 1. All physical dims of a squeezed axis are dropped.
pub(crate) fn squeeze_rule<D: ContainerShape>(
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    let primitive = Primitive::Squeeze;
    expect_arity(primitive, operands, 1)?;
    let operand = &operands[0];
    let dims = usize_list_param(params, "dimensions")?;
    check_axes("dimensions", &dims, operand.rank())?;

    for &axis in &dims {
        let structure = &operand.axes()[axis];
        if !structure.container().is_trivial() {
            return Err(TreeError::InvalidSqueezeAxis {
                axis,
                detail: format!("axis carries container {:?}", structure.container()),
            });
        }
        if structure.is_partitioned() || structure.axis_length() != 1 {
            return Err(TreeError::InvalidSqueezeAxis {
                axis,
                detail: format!("layout {:?} is not a single unit segment", structure.segments()),
            });
        }
    }

    let out_axes = operand
        .axes()
        .iter()
        .enumerate()
        .filter(|(axis, _)| !dims.contains(axis))
        .map(|(_, structure)| structure.clone())
        .collect::<Vec<_>>();
    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    for (coords, block) in operand.blocks().iter() {
        let physical = physical_subaxis_range(operand.axes(), &coords, &dims)?;
        let out_coords = coords
            .iter()
            .enumerate()
            .filter(|(axis, _)| !dims.contains(axis))
            .map(|(_, &coord)| coord)
            .collect::<Coords>();
        let leaf_params = block_params(params, [("dimensions", format_usize_list(&physical))]);
        let squeezed = run_kernel(primitive, std::slice::from_ref(block), &leaf_params)?;
        out.insert(&out_coords, squeezed)?;
    }
    Ok((out_axes, out))
}

/// Permutes axes with `permutation`; each block is transposed by the
/// concatenated physical ranges of the axes in permuted order.
pub(crate) fn transpose_rule<D: ContainerShape>(
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    let primitive = Primitive::Transpose;
    expect_arity(primitive, operands, 1)?;
    let operand = &operands[0];
    let perm = usize_list_param(params, "permutation")?;
    if perm.len() != operand.rank() {
        return Err(TreeError::InvalidParam {
            key: "permutation".to_owned(),
            detail: format!(
                "{perm:?} has {} entries for rank {}",
                perm.len(),
                operand.rank()
            ),
        });
    }
    check_axes("permutation", &perm, operand.rank())?;

    let out_axes = perm
        .iter()
        .map(|&axis| operand.axes()[axis].clone())
        .collect::<Vec<_>>();
    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    for (coords, block) in operand.blocks().iter() {
        let out_coords = perm.iter().map(|&axis| coords[axis]).collect::<Coords>();
        let physical = physical_subaxis_range(operand.axes(), &coords, &perm)?;
        let leaf_params = block_params(params, [("permutation", format_usize_list(&physical))]);
        let transposed = run_kernel(primitive, std::slice::from_ref(block), &leaf_params)?;
        out.insert(&out_coords, transposed)?;
    }
    Ok((out_axes, out))
}

#[cfg(test)]
mod tests {
    use super::{squeeze_rule, transpose_rule};
    use crate::structure::{AxisStructure, StructuredValue};
    use crate::{BlockStore, TreeError, convert_leaf};
    use std::collections::BTreeMap;
    use tv_core::{Shape, Value};
    use tv_tree::TreeDef;

    fn params(key: &str, value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(key.to_owned(), value.to_owned())])
    }

    /// Axis 0 plain of length 2, axis 1 a pair with segments `()` and `(2,)`.
    fn grid() -> StructuredValue {
        let axes = vec![
            AxisStructure::trivial(2),
            AxisStructure::new(
                TreeDef::Tuple(vec![TreeDef::Leaf, TreeDef::Leaf]),
                vec![Shape::scalar(), Shape::vector(2)],
            )
            .expect("axis"),
        ];
        let mut blocks = BlockStore::new(&[1, 2]);
        blocks
            .insert(&[0, 0], Value::vector_i64(&[1, 4]).expect("col"))
            .expect("insert");
        blocks
            .insert(&[0, 1], Value::tensor_i64(&[2, 2], &[2, 3, 5, 6]).expect("cols"))
            .expect("insert");
        StructuredValue::new(axes, blocks).expect("value")
    }

    fn build(result: (Vec<AxisStructure>, BlockStore)) -> StructuredValue {
        StructuredValue::new(result.0, result.1).expect("valid")
    }

    #[test]
    fn transpose_moves_structure_and_blocks() {
        let out = build(transpose_rule(&[grid()], &params("permutation", "1,0")).expect("t"));
        assert_eq!(out.shape().dims, vec![3, 2]);
        assert_eq!(out.axes()[0], grid().axes()[1]);
        assert_eq!(out.block(&[0, 0]), Some(&Value::vector_i64(&[1, 4]).expect("row")));
        assert_eq!(
            out.block(&[1, 0]),
            Some(&Value::tensor_i64(&[2, 2], &[2, 5, 3, 6]).expect("rows"))
        );
    }

    #[test]
    fn transpose_rejects_non_permutation() {
        assert!(matches!(
            transpose_rule(&[grid()], &params("permutation", "0,0")),
            Err(TreeError::InvalidParam { .. })
        ));
        assert!(matches!(
            transpose_rule(&[grid()], &params("permutation", "0")),
            Err(TreeError::InvalidParam { .. })
        ));
    }

    #[test]
    fn squeeze_drops_unit_axis() {
        let x = convert_leaf::<TreeDef>(Value::tensor_i64(&[1, 3], &[1, 2, 3]).expect("x"))
            .expect("x");
        let out = build(squeeze_rule(&[x], &params("dimensions", "0")).expect("squeeze"));
        assert_eq!(out.lower(), Some(&Value::vector_i64(&[1, 2, 3]).expect("v")));
    }

    #[test]
    fn squeeze_rejects_structured_or_long_axes() {
        let err = squeeze_rule(&[grid()], &params("dimensions", "1")).expect_err("structured");
        assert!(matches!(err, TreeError::InvalidSqueezeAxis { axis: 1, .. }));
        let err = squeeze_rule(&[grid()], &params("dimensions", "0")).expect_err("long");
        assert!(matches!(err, TreeError::InvalidSqueezeAxis { axis: 0, .. }));
    }
}

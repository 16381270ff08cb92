#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::Primitive;
use tv_lax::format_usize_list;
use tv_tree::ContainerShape;

use super::{
    RuleOutput, block_params, check_axes, expect_arity, optional_usize_list_param,
    usize_list_param,
};
use crate::block_store::BlockStore;
use crate::coords::{Coords, iterate_coordinates, physical_subaxis_range};
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

/// `dot_general` over structured operands.
///
/// Params: `lhs_contracting_dimensions`, `rhs_contracting_dimensions` and the
/// optional `lhs_batch_dimensions`/`rhs_batch_dimensions`, which must be
/// equal. Paired axes must carry identical structure. Result axes are the
/// batch axes, then the remaining lhs axes, then the remaining rhs axes.
/// Partial products over contracted partitions are summed.
pub(crate) fn dot_general_rule<D: ContainerShape>(
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    let primitive = Primitive::DotGeneral;
    expect_arity(primitive, operands, 2)?;
    let (lhs, rhs) = (&operands[0], &operands[1]);

    let lhs_contract = usize_list_param(params, "lhs_contracting_dimensions")?;
    let rhs_contract = usize_list_param(params, "rhs_contracting_dimensions")?;
    let lhs_batch = optional_usize_list_param(params, "lhs_batch_dimensions")?.unwrap_or_default();
    let rhs_batch = optional_usize_list_param(params, "rhs_batch_dimensions")?.unwrap_or_default();
    if lhs_batch != rhs_batch {
        return Err(TreeError::InvalidParam {
            key: "rhs_batch_dimensions".to_owned(),
            detail: format!("batch dimensions differ: lhs {lhs_batch:?}, rhs {rhs_batch:?}"),
        });
    }
    if lhs_contract.len() != rhs_contract.len() {
        return Err(TreeError::InvalidParam {
            key: "rhs_contracting_dimensions".to_owned(),
            detail: format!(
                "{} lhs contracting dimensions but {} rhs",
                lhs_contract.len(),
                rhs_contract.len()
            ),
        });
    }
    let batch = lhs_batch;
    let lhs_paired = batch.iter().chain(&lhs_contract).copied().collect::<Vec<_>>();
    let rhs_paired = batch.iter().chain(&rhs_contract).copied().collect::<Vec<_>>();
    check_axes("lhs_contracting_dimensions", &lhs_paired, lhs.rank())?;
    check_axes("rhs_contracting_dimensions", &rhs_paired, rhs.rank())?;

    for (&l, &r) in lhs_paired.iter().zip(&rhs_paired) {
        let (la, ra) = (&lhs.axes()[l], &rhs.axes()[r]);
        if la.container() != ra.container() {
            return Err(TreeError::ConflictingStructure {
                axis: l,
                detail: format!("{:?} vs {:?}", la.container(), ra.container()),
            });
        }
        if la.segments() != ra.segments() {
            return Err(TreeError::ConflictingShape {
                axis: l,
                detail: format!("{:?} vs {:?}", la.segments(), ra.segments()),
            });
        }
    }

    let lhs_free = (0..lhs.rank())
        .filter(|axis| !lhs_paired.contains(axis))
        .collect::<Vec<_>>();
    let rhs_free = (0..rhs.rank())
        .filter(|axis| !rhs_paired.contains(axis))
        .collect::<Vec<_>>();
    let rhs_free_axes = rhs_free
        .iter()
        .map(|&axis| rhs.axes()[axis].clone())
        .collect::<Vec<_>>();
    let out_axes = batch
        .iter()
        .chain(&lhs_free)
        .map(|&axis| lhs.axes()[axis].clone())
        .chain(rhs_free_axes.iter().cloned())
        .collect::<Vec<_>>();

    let extents = out_axes
        .iter()
        .map(AxisStructure::leaf_count)
        .collect::<Vec<_>>();
    let mut out = BlockStore::new(&extents);
    let no_params = BTreeMap::new();

    for (lhs_coords, lhs_block) in lhs.blocks().iter() {
        for free_coords in iterate_coordinates(&rhs_free_axes) {
            let mut rhs_coords = Coords::from_elem(0, rhs.rank());
            for (&l, &r) in lhs_paired.iter().zip(&rhs_paired) {
                rhs_coords[r] = lhs_coords[l];
            }
            for (&r, &coord) in rhs_free.iter().zip(&free_coords) {
                rhs_coords[r] = coord;
            }
            let rhs_block = rhs.block(&rhs_coords).ok_or_else(|| {
                TreeError::InvalidStructure(format!(
                    "missing rhs block at {:?}",
                    rhs_coords.as_slice()
                ))
            })?;

            let out_coords = batch
                .iter()
                .chain(&lhs_free)
                .map(|&axis| lhs_coords[axis])
                .chain(free_coords.iter().copied())
                .collect::<Coords>();
            let leaf_params = block_params(
                params,
                [
                    (
                        "lhs_contracting_dimensions",
                        physical_list(lhs.axes(), &lhs_coords, &lhs_contract)?,
                    ),
                    (
                        "rhs_contracting_dimensions",
                        physical_list(rhs.axes(), &rhs_coords, &rhs_contract)?,
                    ),
                    (
                        "lhs_batch_dimensions",
                        physical_list(lhs.axes(), &lhs_coords, &batch)?,
                    ),
                    (
                        "rhs_batch_dimensions",
                        physical_list(rhs.axes(), &rhs_coords, &batch)?,
                    ),
                ],
            );
            let partial = run_kernel(
                primitive,
                &[lhs_block.clone(), rhs_block.clone()],
                &leaf_params,
            )?;
            out.accumulate(&out_coords, partial, |acc, next| {
                run_kernel(Primitive::Add, &[acc, next], &no_params)
            })?;
        }
    }
    Ok((out_axes, out))
}

fn physical_list<D>(
    axes: &[AxisStructure<D>],
    coords: &[usize],
    targets: &[usize],
) -> Result<String, TreeError> {
    physical_subaxis_range(axes, coords, targets).map(|physical| format_usize_list(&physical))
}

#[cfg(test)]
mod tests {
    use super::dot_general_rule;
    use crate::structure::{AxisStructure, StructuredValue};
    use crate::{BlockStore, TreeError, convert_leaf};
    use std::collections::BTreeMap;
    use tv_core::{Shape, Value};
    use tv_tree::TreeDef;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn inner() -> BTreeMap<String, String> {
        params(&[
            ("lhs_contracting_dimensions", "0"),
            ("rhs_contracting_dimensions", "0"),
        ])
    }

    /// `1.0`, `[2.0]`, `[3.0, 4.0]` along one axis.
    fn ragged(def: TreeDef) -> StructuredValue {
        let axis = AxisStructure::new(
            def,
            vec![Shape::scalar(), Shape::vector(1), Shape::vector(2)],
        )
        .expect("axis");
        let mut blocks = BlockStore::new(&[3]);
        blocks.insert(&[0], Value::scalar_f64(1.0)).expect("insert");
        blocks
            .insert(&[1], Value::vector_f64(&[2.0]).expect("v"))
            .expect("insert");
        blocks
            .insert(&[2], Value::vector_f64(&[3.0, 4.0]).expect("v"))
            .expect("insert");
        StructuredValue::new(vec![axis], blocks).expect("value")
    }

    fn triple() -> TreeDef {
        TreeDef::List(vec![TreeDef::Leaf, TreeDef::Leaf, TreeDef::Leaf])
    }

    #[test]
    fn inner_product_sums_partial_products() {
        let x = ragged(triple());
        let (axes, blocks) = dot_general_rule(&[x.clone(), x], &inner()).expect("dot");
        let out = StructuredValue::new(axes, blocks).expect("valid");
        assert_eq!(out.rank(), 0);
        assert_eq!(out.block(&[]), Some(&Value::scalar_f64(30.0)));
    }

    #[test]
    fn outer_product_keeps_both_structures() {
        let x = ragged(triple());
        let no_contraction = params(&[
            ("lhs_contracting_dimensions", ""),
            ("rhs_contracting_dimensions", ""),
        ]);
        let (axes, blocks) = dot_general_rule(&[x.clone(), x], &no_contraction).expect("outer");
        let out = StructuredValue::new(axes, blocks).expect("valid");
        assert_eq!(out.shape().dims, vec![4, 4]);
        assert_eq!(
            out.block(&[2, 1]),
            Some(&Value::tensor_f64(&[2, 1], &[6.0, 8.0]).expect("b"))
        );
        assert_eq!(out.block(&[0, 0]), Some(&Value::scalar_f64(1.0)));
    }

    #[test]
    fn mismatched_structures_fail() {
        let x = ragged(triple());
        let y = ragged(TreeDef::Tuple(vec![TreeDef::Leaf, TreeDef::Leaf, TreeDef::Leaf]));
        let err = dot_general_rule(&[x.clone(), y], &inner()).expect_err("structure");
        assert!(matches!(err, TreeError::ConflictingStructure { axis: 0, .. }));

        let plain = convert_leaf::<TreeDef>(Value::vector_f64(&[1.0, 1.0, 1.0, 1.0]).expect("p"))
            .expect("plain");
        let err = dot_general_rule(&[x, plain], &inner()).expect_err("structure");
        assert!(matches!(err, TreeError::ConflictingStructure { axis: 0, .. }));
    }

    #[test]
    fn unequal_batch_dimensions_fail() {
        let a = convert_leaf::<TreeDef>(Value::tensor_f64(&[2, 2], &[1.0; 4]).expect("a"))
            .expect("a");
        let p = params(&[
            ("lhs_contracting_dimensions", "1"),
            ("rhs_contracting_dimensions", "0"),
            ("lhs_batch_dimensions", "0"),
            ("rhs_batch_dimensions", "1"),
        ]);
        let err = dot_general_rule(&[a.clone(), a], &p).expect_err("batch");
        assert!(matches!(err, TreeError::InvalidParam { .. }));
    }

    #[test]
    fn batched_matmul_over_structured_batch_axis() {
        // Batch axis: two leaves of one matrix each.
        let axes = vec![
            AxisStructure::new(
                TreeDef::Tuple(vec![TreeDef::Leaf, TreeDef::Leaf]),
                vec![Shape::vector(1), Shape::vector(1)],
            )
            .expect("batch"),
            AxisStructure::trivial(2),
        ];
        let mut blocks = BlockStore::new(&[2, 1]);
        blocks
            .insert(&[0, 0], Value::tensor_f64(&[1, 2], &[1.0, 2.0]).expect("b0"))
            .expect("insert");
        blocks
            .insert(&[1, 0], Value::tensor_f64(&[1, 2], &[3.0, 4.0]).expect("b1"))
            .expect("insert");
        let x = StructuredValue::new(axes, blocks).expect("x");
        let p = params(&[
            ("lhs_contracting_dimensions", "1"),
            ("rhs_contracting_dimensions", "1"),
            ("lhs_batch_dimensions", "0"),
            ("rhs_batch_dimensions", "0"),
        ]);
        let (axes, blocks) = dot_general_rule(&[x.clone(), x], &p).expect("bmm");
        let out = StructuredValue::new(axes, blocks).expect("valid");
        assert_eq!(out.rank(), 1);
        assert_eq!(out.block(&[0]), Some(&Value::vector_f64(&[5.0]).expect("v")));
        assert_eq!(out.block(&[1]), Some(&Value::vector_f64(&[25.0]).expect("v")));
    }
}

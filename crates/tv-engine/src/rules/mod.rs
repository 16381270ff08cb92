#![forbid(unsafe_code)]

//! Structural rewrite rules, one module per rule family.
//!
//! Every rule takes the operands' axis structures and blocks and returns the
//! result's axis structures and blocks; the caller re-validates them into a
//! [`StructuredValue`].

mod broadcast;
mod concatenate;
mod contraction;
mod elementwise;
mod nary;
mod reduction;
mod shape;

use std::collections::BTreeMap;
use tv_core::{Primitive, Shape};
use tv_lax::parse_usize_list;
use tv_tree::ContainerShape;

use crate::block_store::BlockStore;
use crate::registry::RuleKind;
use crate::structure::{AxisStructure, StructuredValue};
use crate::TreeError;

pub(crate) type RuleOutput<D> = (Vec<AxisStructure<D>>, BlockStore);

pub(crate) fn apply_rule<D: ContainerShape>(
    kind: RuleKind,
    primitive: Primitive,
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    match kind {
        RuleKind::Elementwise => elementwise::elementwise_rule(primitive, operands, params),
        RuleKind::Nary => nary::nary_rule(primitive, operands, params),
        RuleKind::Concatenate => concatenate::concatenate_rule(operands, params),
        RuleKind::BroadcastInDim => broadcast::broadcast_in_dim_rule(operands, params),
        RuleKind::ExpandDims => broadcast::expand_dims_rule(operands, params),
        RuleKind::Squeeze => shape::squeeze_rule(operands, params),
        RuleKind::Transpose => shape::transpose_rule(operands, params),
        RuleKind::Reduce { combiner } => {
            reduction::reduce_rule(primitive, combiner, operands, params)
        }
        RuleKind::DotGeneral => contraction::dot_general_rule(operands, params),
    }
}

// ── Param helpers ──────────────────────────────────────────────────

pub(crate) fn usize_list_param(
    params: &BTreeMap<String, String>,
    key: &str,
) -> Result<Vec<usize>, TreeError> {
    let raw = params.get(key).ok_or_else(|| TreeError::InvalidParam {
        key: key.to_owned(),
        detail: "missing required param".to_owned(),
    })?;
    parse_usize_list(raw).ok_or_else(|| TreeError::InvalidParam {
        key: key.to_owned(),
        detail: format!("expected comma-separated integers, got '{raw}'"),
    })
}

pub(crate) fn optional_usize_list_param(
    params: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<Vec<usize>>, TreeError> {
    if params.contains_key(key) {
        usize_list_param(params, key).map(Some)
    } else {
        Ok(None)
    }
}

pub(crate) fn single_usize_param(
    params: &BTreeMap<String, String>,
    key: &str,
) -> Result<usize, TreeError> {
    match usize_list_param(params, key)?.as_slice() {
        [value] => Ok(*value),
        other => Err(TreeError::InvalidParam {
            key: key.to_owned(),
            detail: format!("expected a single integer, got {other:?}"),
        }),
    }
}

/// Rejects out-of-range and repeated axes.
pub(crate) fn check_axes(key: &str, axes: &[usize], rank: usize) -> Result<(), TreeError> {
    let mut seen = vec![false; rank];
    for &axis in axes {
        if axis >= rank {
            return Err(TreeError::InvalidParam {
                key: key.to_owned(),
                detail: format!("axis {axis} out of range for rank {rank}"),
            });
        }
        if std::mem::replace(&mut seen[axis], true) {
            return Err(TreeError::InvalidParam {
                key: key.to_owned(),
                detail: format!("axis {axis} repeated"),
            });
        }
    }
    Ok(())
}

/// Copy of `params` with `overrides` replacing or adding entries.
pub(crate) fn block_params(
    params: &BTreeMap<String, String>,
    overrides: impl IntoIterator<Item = (&'static str, String)>,
) -> BTreeMap<String, String> {
    let mut out = params.clone();
    for (key, value) in overrides {
        out.insert(key.to_owned(), value);
    }
    out
}

pub(crate) fn expect_arity<D>(
    primitive: Primitive,
    operands: &[StructuredValue<D>],
    expected: usize,
) -> Result<(), TreeError> {
    if operands.len() != expected {
        return Err(TreeError::ArityMismatch {
            primitive,
            expected,
            actual: operands.len(),
        });
    }
    Ok(())
}

/// All operands must share the first operand's rank.
pub(crate) fn common_rank<D: ContainerShape>(
    primitive: Primitive,
    operands: &[&StructuredValue<D>],
) -> Result<usize, TreeError> {
    let rank = operands.first().map_or(0, |operand| operand.rank());
    if let Some(other) = operands.iter().find(|operand| operand.rank() != rank) {
        return Err(TreeError::RankMismatch {
            primitive,
            expected: rank,
            actual: other.rank(),
        });
    }
    Ok(rank)
}

// ── Axis reconciliation ────────────────────────────────────────────

/// The one non-trivial container among `axes`, or the trivial descriptor.
pub(crate) fn common_container<D: ContainerShape>(
    axis: usize,
    axes: &[&AxisStructure<D>],
) -> Result<D, TreeError> {
    let mut found: Option<&D> = None;
    for candidate in axes.iter().map(|a| a.container()) {
        if candidate.is_trivial() {
            continue;
        }
        match found {
            None => found = Some(candidate),
            Some(existing) if existing == candidate => {}
            Some(existing) => {
                return Err(TreeError::ConflictingStructure {
                    axis,
                    detail: format!("{existing:?} vs {candidate:?}"),
                });
            }
        }
    }
    Ok(found.cloned().unwrap_or_else(D::trivial))
}

/// The one partitioned (not single-segment) layout among `axes`, if any.
pub(crate) fn common_partitioned_layout<D: ContainerShape>(
    axis: usize,
    axes: &[&AxisStructure<D>],
) -> Result<Option<Vec<Shape>>, TreeError> {
    let mut found: Option<&[Shape]> = None;
    for candidate in axes
        .iter()
        .filter(|a| a.is_partitioned())
        .map(|a| a.segments())
    {
        match found {
            None => found = Some(candidate),
            Some(existing) if existing == candidate => {}
            Some(existing) => {
                return Err(TreeError::ConflictingShape {
                    axis,
                    detail: format!("{existing:?} vs {candidate:?}"),
                });
            }
        }
    }
    Ok(found.map(<[Shape]>::to_vec))
}

/// Single-segment layout shared by every operand of full length `size`,
/// if they all agree.
pub(crate) fn shared_full_length_layout<D: ContainerShape>(
    axes: &[&AxisStructure<D>],
    size: u64,
) -> Option<Vec<Shape>> {
    let mut full = axes.iter().filter(|a| a.axis_length() == size);
    let first = full.next()?.segments();
    full.all(|a| a.segments() == first).then(|| first.to_vec())
}

pub(crate) fn flat_segment(axis: usize, length: u64) -> Result<Vec<Shape>, TreeError> {
    let len = u32::try_from(length).map_err(|_| TreeError::InvalidStructure(format!(
        "axis {axis} length {length} exceeds the supported dimension size"
    )))?;
    Ok(vec![Shape::vector(len)])
}

/// Pairs the reconciled container with the reconciled layout.
pub(crate) fn finish_axis<D: ContainerShape>(
    axis: usize,
    container: D,
    segments: Vec<Shape>,
) -> Result<AxisStructure<D>, TreeError> {
    if container.leaf_count() != segments.len() {
        return Err(TreeError::ConflictingStructure {
            axis,
            detail: format!(
                "container {container:?} has {} leaves but the layout has {} segments",
                container.leaf_count(),
                segments.len()
            ),
        });
    }
    AxisStructure::new(container, segments)
}

#[cfg(test)]
mod tests {
    use super::{
        block_params, check_axes, common_container, common_partitioned_layout,
        shared_full_length_layout, single_usize_param, usize_list_param,
    };
    use crate::TreeError;
    use crate::structure::AxisStructure;
    use std::collections::BTreeMap;
    use tv_core::Shape;
    use tv_tree::TreeDef;

    fn dict(keys: &[&str]) -> TreeDef {
        TreeDef::Dict(
            keys.iter()
                .map(|k| ((*k).to_owned(), TreeDef::Leaf))
                .collect(),
        )
    }

    #[test]
    fn param_parsing_reports_key() {
        let params = BTreeMap::from([("axes".to_owned(), "0,x".to_owned())]);
        let err = usize_list_param(&params, "axes").expect_err("malformed");
        assert!(matches!(err, TreeError::InvalidParam { ref key, .. } if key == "axes"));
        assert!(usize_list_param(&params, "missing").is_err());

        let params = BTreeMap::from([("dimension".to_owned(), "1,2".to_owned())]);
        assert!(single_usize_param(&params, "dimension").is_err());
    }

    #[test]
    fn axes_must_be_unique_and_in_range() {
        assert!(check_axes("axes", &[0, 1], 2).is_ok());
        assert!(check_axes("axes", &[0, 0], 2).is_err());
        assert!(check_axes("axes", &[2], 2).is_err());
    }

    #[test]
    fn block_params_override_keeps_other_entries() {
        let params = BTreeMap::from([
            ("axes".to_owned(), "0".to_owned()),
            ("keep".to_owned(), "yes".to_owned()),
        ]);
        let out = block_params(&params, [("axes", "1,2".to_owned())]);
        assert_eq!(out.get("axes").map(String::as_str), Some("1,2"));
        assert_eq!(out.get("keep").map(String::as_str), Some("yes"));
    }

    #[test]
    fn conflicting_containers_are_reported() {
        let ab = AxisStructure::new(dict(&["a", "b"]), vec![Shape::vector(1); 2]).expect("ab");
        let cd = AxisStructure::new(dict(&["c", "d"]), vec![Shape::vector(1); 2]).expect("cd");
        let flat = AxisStructure::<TreeDef>::trivial(2);
        assert_eq!(
            common_container(0, &[&ab, &flat]).expect("one container"),
            dict(&["a", "b"])
        );
        let err = common_container(3, &[&ab, &cd]).expect_err("conflict");
        assert!(matches!(err, TreeError::ConflictingStructure { axis: 3, .. }));
    }

    #[test]
    fn conflicting_partitioned_layouts_are_reported() {
        let def = dict(&["a", "b"]);
        let x = AxisStructure::new(def.clone(), vec![Shape::vector(1), Shape::vector(2)])
            .expect("x");
        let y = AxisStructure::new(def, vec![Shape::vector(2), Shape::vector(1)]).expect("y");
        assert!(common_partitioned_layout(0, &[&x, &x]).expect("same").is_some());
        let err = common_partitioned_layout(0, &[&x, &y]).expect_err("conflict");
        assert!(matches!(err, TreeError::ConflictingShape { .. }));
    }

    #[test]
    fn full_length_layout_requires_agreement() {
        let a = AxisStructure::<TreeDef>::single(Shape::new(vec![2, 2]));
        let b = AxisStructure::<TreeDef>::trivial(4);
        let one = AxisStructure::<TreeDef>::trivial(1);
        assert_eq!(
            shared_full_length_layout(&[&a, &one, &a], 4),
            Some(vec![Shape::new(vec![2, 2])])
        );
        assert_eq!(shared_full_length_layout(&[&a, &b], 4), None);
    }
}

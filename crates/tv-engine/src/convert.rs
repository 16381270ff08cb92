#![forbid(unsafe_code)]

//! Conversion between containers of plain arrays and structured values.

use log::trace;
use std::collections::BTreeMap;
use tv_core::{DType, Primitive, Value};
use tv_tree::{ContainerCodec, ContainerShape};

use crate::block_store::BlockStore;
use crate::config::EngineConfig;
use crate::structure::{AxisStructure, StructuredValue};
use crate::{TreeError, run_kernel};

/// Lifts a container into a rank-1 structured value.
///
/// The single axis carries the container's descriptor and one segment per
/// leaf, equal to that leaf's shape. Leaves are promoted to a common dtype
/// unless `config.promote_leaves` is off, in which case mixed dtypes fail.
pub fn convert<C: ContainerCodec>(
    codec: &C,
    container: &C::Container,
    config: &EngineConfig,
) -> Result<StructuredValue<C::Shape>, TreeError> {
    let (leaves, shape) = codec.flatten(container);
    let dtype = leaves
        .iter()
        .map(Value::dtype)
        .reduce(DType::promote)
        .ok_or_else(|| TreeError::InvalidStructure(format!("container {shape:?} has no leaves")))?;
    if !config.promote_leaves {
        if let Some(other) = leaves.iter().find(|leaf| leaf.dtype() != dtype) {
            return Err(TreeError::InvalidStructure(format!(
                "mixed leaf dtypes {} and {} with promotion disabled",
                other.dtype().as_str(),
                dtype.as_str()
            )));
        }
    }

    let segments = leaves.iter().map(Value::shape).collect();
    let axis = AxisStructure::new(shape, segments)?;
    let mut blocks = BlockStore::new(&[leaves.len()]);
    for (index, leaf) in leaves.into_iter().enumerate() {
        blocks.insert(&[index], cast(leaf, dtype)?)?;
    }
    StructuredValue::new(vec![axis], blocks)
}

/// Wraps a plain array as a value whose axes are all trivial.
pub fn convert_leaf<D: ContainerShape>(value: Value) -> Result<StructuredValue<D>, TreeError> {
    let shape = value.shape();
    let axes = shape
        .dims
        .iter()
        .map(|&dim| AxisStructure::trivial(dim))
        .collect();
    StructuredValue::new(axes, BlockStore::single(shape.rank(), value))
}

/// [`convert_leaf`] for a container that must itself be a single leaf.
pub fn convert_leaf_container<C: ContainerCodec>(
    codec: &C,
    container: &C::Container,
) -> Result<StructuredValue<C::Shape>, TreeError> {
    let (mut leaves, shape) = codec.flatten(container);
    if !shape.is_trivial() || leaves.len() != 1 {
        return Err(TreeError::NotALeaf(format!("{shape:?}")));
    }
    match leaves.pop() {
        Some(leaf) => convert_leaf(leaf),
        None => Err(TreeError::NotALeaf(format!("{shape:?}"))),
    }
}

/// Rebuilds nested containers from a structured value, innermost axis first.
///
/// Every block becomes a leaf container; then, axis by axis from the last,
/// each run of `leaf_count` siblings is unflattened with that axis's
/// descriptor. Fully trivial values come back as a single leaf.
pub fn restore<C: ContainerCodec>(
    codec: &C,
    value: &StructuredValue<C::Shape>,
) -> Result<C::Container, TreeError> {
    let mut level = value
        .blocks()
        .iter()
        .map(|(_, block)| codec.leaf(block.clone()))
        .collect::<Vec<_>>();
    for axis in value.axes().iter().rev() {
        let group = axis.leaf_count();
        if group == 0 {
            return Err(TreeError::InvalidStructure(
                "cannot restore an axis with no partitions".to_owned(),
            ));
        }
        let mut children = level.into_iter();
        let mut next = Vec::new();
        loop {
            let chunk = children.by_ref().take(group).collect::<Vec<_>>();
            if chunk.is_empty() {
                break;
            }
            next.push(codec.unflatten(axis.container(), chunk)?);
        }
        level = next;
    }
    trace!("restored value of shape {}", value.shape());
    level
        .pop()
        .ok_or_else(|| TreeError::InvalidStructure("nothing to restore".to_owned()))
}

fn cast(value: Value, dtype: DType) -> Result<Value, TreeError> {
    if value.dtype() == dtype {
        return Ok(value);
    }
    run_kernel(
        Primitive::ConvertElementType,
        &[value],
        &BTreeMap::from([("new_dtype".to_owned(), dtype.as_str().to_owned())]),
    )
}

#[cfg(test)]
mod tests {
    use super::{convert, convert_leaf, convert_leaf_container, restore};
    use crate::{EngineConfig, TreeError};
    use tv_core::{DType, Shape, Value};
    use tv_tree::{PyTreeCodec, Tree, TreeDef};

    fn mixed() -> Tree {
        Tree::dict([
            ("x", Tree::leaf(Value::scalar_i64(1))),
            (
                "y",
                Tree::List(vec![Tree::leaf(Value::vector_f64(&[2.0, 3.0]).expect("v"))]),
            ),
        ])
    }

    #[test]
    fn convert_uses_leaf_shapes_as_segments() {
        let value = convert(&PyTreeCodec, &mixed(), &EngineConfig::default()).expect("convert");
        assert_eq!(value.rank(), 1);
        assert_eq!(
            value.axes()[0].segments(),
            &[Shape::scalar(), Shape::vector(2)]
        );
        assert_eq!(value.dtype(), DType::F64);
        assert_eq!(value.block(&[0]), Some(&Value::scalar_f64(1.0)));
        assert_eq!(value.shape().dims, vec![3]);
    }

    #[test]
    fn convert_without_promotion_rejects_mixed_dtypes() {
        let config = EngineConfig {
            promote_leaves: false,
            ..EngineConfig::default()
        };
        let err = convert(&PyTreeCodec, &mixed(), &config).expect_err("mixed");
        assert!(matches!(err, TreeError::InvalidStructure(_)));
    }

    #[test]
    fn convert_rejects_empty_container() {
        let err = convert(&PyTreeCodec, &Tree::Tuple(vec![]), &EngineConfig::default())
            .expect_err("empty");
        assert!(matches!(err, TreeError::InvalidStructure(_)));
    }

    #[test]
    fn scalar_leaf_converts_to_a_non_trivial_axis() {
        let value = convert(
            &PyTreeCodec,
            &Tree::leaf(Value::scalar_f64(1.0)),
            &EngineConfig::default(),
        )
        .expect("convert");
        assert_eq!(value.axes()[0].segments(), &[Shape::scalar()]);
        assert!(!value.is_fully_trivial());
    }

    #[test]
    fn restore_inverts_convert() {
        let tree = mixed();
        let value = convert(&PyTreeCodec, &tree, &EngineConfig::default()).expect("convert");
        let back = restore(&PyTreeCodec, &value).expect("restore");
        let expected = Tree::dict([
            ("x", Tree::leaf(Value::scalar_f64(1.0))),
            (
                "y",
                Tree::List(vec![Tree::leaf(Value::vector_f64(&[2.0, 3.0]).expect("v"))]),
            ),
        ]);
        assert_eq!(back, expected);
    }

    #[test]
    fn convert_leaf_is_fully_trivial() {
        let value =
            convert_leaf::<TreeDef>(Value::tensor_i64(&[2, 3], &[0; 6]).expect("v")).expect("leaf");
        assert!(value.is_fully_trivial());
        assert_eq!(value.rank(), 2);
        let back = restore(&PyTreeCodec, &value).expect("restore");
        assert_eq!(back, Tree::leaf(Value::tensor_i64(&[2, 3], &[0; 6]).expect("v")));
    }

    #[test]
    fn leaf_container_rejects_nested_input() {
        let err = convert_leaf_container(&PyTreeCodec, &mixed()).expect_err("nested");
        assert!(matches!(err, TreeError::NotALeaf(_)));
        let ok = convert_leaf_container(&PyTreeCodec, &Tree::leaf(Value::scalar_i64(3)))
            .expect("leaf");
        assert_eq!(ok.rank(), 0);
    }
}

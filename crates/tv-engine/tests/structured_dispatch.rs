#![forbid(unsafe_code)]

//! End-to-end behavior of structured dispatch over converted trees.

use std::collections::BTreeMap;
use tv_core::{DType, Literal, Primitive, Shape, TensorValue, Value};
use tv_engine::{
    BlockStore, Dispatcher, EngineConfig, StructuredValue, TreeError, convert, convert_leaf,
    dispatch, restore, split_along_axis,
};
use tv_lax::eval_primitive;
use tv_test_utils::{DEFAULT_TOLERANCE, tree_from_json, values_close};
use tv_tree::{PyTreeCodec, Tree, TreeDef};

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn structured(json: &str) -> StructuredValue {
    let tree = tree_from_json(json).expect("fixture should parse");
    convert(&PyTreeCodec, &tree, &EngineConfig::default()).expect("convert should succeed")
}

fn restored(value: &StructuredValue) -> Tree {
    restore(&PyTreeCodec, value).expect("restore should succeed")
}

fn scalar_of(value: &StructuredValue) -> Value {
    match restored(value) {
        Tree::Leaf(v) => v,
        other => panic!("expected a leaf, got {other:?}"),
    }
}

const RAGGED: &str = r#"{"x": 1.0, "y": [2.0], "z": [[3.0, 4.0]]}"#;

// ── Reductions ─────────────────────────────────────────────────────

#[test]
fn reductions_over_ragged_tree() {
    let x = structured(RAGGED);
    let cases = [
        (Primitive::ReduceSum, 10.0),
        (Primitive::ReduceMax, 4.0),
        (Primitive::ReduceProd, 24.0),
        (Primitive::ReduceMin, 1.0),
    ];
    for (primitive, expected) in cases {
        let out = dispatch(primitive, std::slice::from_ref(&x), &params(&[("axes", "0")]))
            .expect("reduction should succeed");
        assert_eq!(out.rank(), 0, "{primitive}");
        assert_eq!(scalar_of(&out), Value::scalar_f64(expected), "{primitive}");
    }
}

#[test]
fn reduce_without_axes_reduces_everything() {
    let x = structured(r#"[{"array": [1, 2, 3, 4], "shape": [2, 2]}, 5.0]"#);
    let out = dispatch(Primitive::ReduceSum, &[x], &BTreeMap::new()).expect("sum");
    assert_eq!(scalar_of(&out), Value::scalar_f64(15.0));
}

#[test]
fn any_and_all_over_bool_leaves() {
    let x = structured(r#"{"a": true, "b": [false, true]}"#);
    let any = dispatch(Primitive::ReduceOr, std::slice::from_ref(&x), &BTreeMap::new())
        .expect("any");
    let all = dispatch(Primitive::ReduceAnd, &[x], &BTreeMap::new()).expect("all");
    assert_eq!(scalar_of(&any), Value::scalar_bool(true));
    assert_eq!(scalar_of(&all), Value::scalar_bool(false));
}

#[test]
fn bool_max_stays_bool_across_partitions() {
    let x = structured(r#"[false, {"array": [0, 1], "shape": [2], "dtype": "bool"}]"#);
    let out = dispatch(Primitive::ReduceMax, &[x], &BTreeMap::new()).expect("max");
    assert_eq!(out.dtype(), DType::Bool);
    assert_eq!(scalar_of(&out), Value::scalar_bool(true));
}

// ── N-ary ──────────────────────────────────────────────────────────

#[test]
fn add_preserves_structure_and_commutes() {
    let x = structured(RAGGED);
    let y = structured(r#"{"x": 10.0, "y": [20.0], "z": [[30.0, 40.0]]}"#);
    let xy = dispatch(Primitive::Add, &[x.clone(), y.clone()], &BTreeMap::new()).expect("x+y");
    let yx = dispatch(Primitive::Add, &[y, x], &BTreeMap::new()).expect("y+x");
    assert_eq!(xy, yx);
    assert_eq!(
        restored(&xy),
        tree_from_json(r#"{"x": 11.0, "y": [22.0], "z": [[33.0, 44.0]]}"#).expect("expected")
    );
}

#[test]
fn conflicting_dict_keys_are_rejected() {
    let ab = structured(r#"{"a": 1.0, "b": 2.0}"#);
    let cd = structured(r#"{"c": 1.0, "d": 2.0}"#);
    let err = dispatch(Primitive::Add, &[ab, cd], &BTreeMap::new()).expect_err("conflict");
    assert!(matches!(err, TreeError::ConflictingStructure { axis: 0, .. }));
}

#[test]
fn converted_scalars_add_without_splitting() {
    let one = convert(
        &PyTreeCodec,
        &Tree::leaf(Value::scalar_f64(1.0)),
        &EngineConfig::default(),
    )
    .expect("one");
    let out = dispatch(Primitive::Add, &[one.clone(), one], &BTreeMap::new()).expect("add");
    assert_eq!(out.axes()[0].segments(), &[Shape::scalar()]);
    assert_eq!(restored(&out), Tree::leaf(Value::scalar_f64(2.0)));
}

#[test]
fn plain_vector_broadcasts_over_tree() {
    let x = structured(r#"[1.0, {"array": [2.0, 3.0], "shape": [2]}]"#);
    let plain = convert_leaf(Value::vector_f64(&[100.0, 200.0, 300.0]).expect("plain"))
        .expect("plain");
    let out = dispatch(Primitive::Add, &[x, plain], &BTreeMap::new()).expect("add");
    assert_eq!(
        restored(&out),
        tree_from_json(r#"[101.0, {"array": [202.0, 303.0], "shape": [2]}]"#).expect("expected")
    );
}

// ── Contraction ────────────────────────────────────────────────────

#[test]
fn dot_of_tree_with_itself() {
    let x = structured("[1.0, 2.0, 3.0, 4.0]");
    let out = dispatch(
        Primitive::DotGeneral,
        &[x.clone(), x],
        &params(&[
            ("lhs_contracting_dimensions", "0"),
            ("rhs_contracting_dimensions", "0"),
        ]),
    )
    .expect("dot");
    assert_eq!(scalar_of(&out), Value::scalar_f64(30.0));
}

// ── Structural ops ─────────────────────────────────────────────────

#[test]
fn concatenate_on_structured_axis_is_rejected() {
    let x = structured(RAGGED);
    let err = dispatch(
        Primitive::Concatenate,
        &[x.clone(), x],
        &params(&[("dimension", "0")]),
    )
    .expect_err("structured axis");
    assert!(matches!(err, TreeError::InvalidConcatenateAxis { axis: 0, .. }));
}

#[test]
fn split_then_concatenate_restores_the_block() {
    let original = Value::tensor_i64(&[2, 3], &[1, 2, 3, 4, 5, 6]).expect("block");
    let layout = vec![vec![Shape::vector(2)], vec![Shape::vector(3)]];
    let mut blocks = BlockStore::new(&[1, 1]);
    blocks.insert(&[0, 0], original.clone()).expect("insert");

    let split = split_along_axis(&layout, &blocks, 0, &[Shape::vector(1), Shape::vector(1)])
        .expect("split");
    let pieces = [
        split.get(&[0, 0]).cloned().expect("first"),
        split.get(&[1, 0]).cloned().expect("second"),
    ];
    let joined = eval_primitive(Primitive::Concatenate, &pieces, &params(&[("dimension", "0")]))
        .expect("concat");
    assert_eq!(joined, original);
}

#[test]
fn expand_then_squeeze_is_identity() {
    let x = structured(RAGGED);
    let expanded = dispatch(
        Primitive::ExpandDims,
        std::slice::from_ref(&x),
        &params(&[("dimensions", "0")]),
    )
    .expect("expand");
    assert_eq!(expanded.shape().dims, vec![1, 4]);
    let squeezed = dispatch(
        Primitive::Squeeze,
        &[expanded],
        &params(&[("dimensions", "0")]),
    )
    .expect("squeeze");
    assert_eq!(squeezed, x);
}

#[test]
fn squeeze_of_structured_axis_is_rejected() {
    let x = structured(r#"{"only": 1.0}"#);
    let err = dispatch(Primitive::Squeeze, &[x], &params(&[("dimensions", "0")]))
        .expect_err("structured");
    assert!(matches!(err, TreeError::InvalidSqueezeAxis { axis: 0, .. }));
}

#[test]
fn broadcast_then_transpose_moves_the_tree_axis() {
    let x = structured(RAGGED);
    let wide = dispatch(
        Primitive::BroadcastInDim,
        &[x],
        &params(&[("shape", "4,2"), ("broadcast_dimensions", "0")]),
    )
    .expect("broadcast");
    assert_eq!(wide.shape().dims, vec![4, 2]);
    let flipped = dispatch(
        Primitive::Transpose,
        std::slice::from_ref(&wide),
        &params(&[("permutation", "1,0")]),
    )
    .expect("transpose");
    assert_eq!(flipped.shape().dims, vec![2, 4]);
    assert_eq!(flipped.axes()[1], wide.axes()[0]);

    let summed = dispatch(
        Primitive::ReduceSum,
        &[flipped],
        &params(&[("axes", "0")]),
    )
    .expect("sum");
    assert_eq!(
        restored(&summed),
        tree_from_json(r#"{"x": 2.0, "y": [4.0], "z": [[6.0, 8.0]]}"#).expect("expected")
    );
}

// ── Lowering ───────────────────────────────────────────────────────

#[test]
fn lowering_matches_plain_evaluation() {
    let a = Value::tensor_f64(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).expect("a");
    let b = Value::tensor_f64(&[2, 2], &[0.5, 0.5, 2.0, 2.0]).expect("b");
    let cases: Vec<(Primitive, Vec<Value>, BTreeMap<String, String>)> = vec![
        (Primitive::Mul, vec![a.clone(), b.clone()], BTreeMap::new()),
        (Primitive::Exp, vec![a.clone()], BTreeMap::new()),
        (
            Primitive::ReduceSum,
            vec![a.clone()],
            params(&[("axes", "1")]),
        ),
        (
            Primitive::Transpose,
            vec![b.clone()],
            params(&[("permutation", "1,0")]),
        ),
        (
            Primitive::DotGeneral,
            vec![a, b],
            params(&[
                ("lhs_contracting_dimensions", "1"),
                ("rhs_contracting_dimensions", "0"),
            ]),
        ),
    ];

    let unlowered = Dispatcher::new(EngineConfig {
        lower_trivial: false,
        ..EngineConfig::default()
    });
    for (primitive, inputs, p) in cases {
        let expected = eval_primitive(primitive, &inputs, &p).expect("plain eval");
        let operands = inputs
            .into_iter()
            .map(convert_leaf::<TreeDef>)
            .collect::<Result<Vec<_>, _>>()
            .expect("lift");
        let lowered = dispatch(primitive, &operands, &p).expect("lowered");
        let ruled = unlowered.dispatch(primitive, &operands, &p).expect("rules");
        assert_eq!(lowered.lower(), Some(&expected), "{primitive}");
        let ruled_value = ruled.lower().expect("rule result should stay trivial");
        assert!(
            values_close(ruled_value, &expected, DEFAULT_TOLERANCE),
            "{primitive}"
        );
    }
}

#[test]
fn copy_is_identity_on_structure() {
    let x = structured(RAGGED);
    let out = dispatch(Primitive::Copy, std::slice::from_ref(&x), &BTreeMap::new()).expect("copy");
    assert_eq!(out, x);
}

#[test]
fn mixed_dtype_leaves_promote_on_convert() {
    let tree = Tree::Tuple(vec![
        Tree::leaf(Value::scalar_bool(true)),
        Tree::leaf(Value::Tensor(
            TensorValue::new(
                DType::I64,
                Shape::vector(2),
                vec![Literal::I64(2), Literal::I64(3)],
            )
            .expect("tensor"),
        )),
    ]);
    let value = convert(&PyTreeCodec, &tree, &EngineConfig::default()).expect("convert");
    assert_eq!(value.dtype(), DType::I64);
    assert_eq!(value.block(&[0]), Some(&Value::scalar_i64(1)));
}

#![forbid(unsafe_code)]

//! Fixtures, tolerance helpers and proptest strategies shared by the
//! treevec test suites.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tv_core::{DType, Literal, Shape, TensorValue, Value};
use tv_tree::Tree;

pub const DEFAULT_TOLERANCE: f64 = 1e-9;

// ── Proptest configuration ─────────────────────────────────────────

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("TV_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        512
    } else {
        128
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    ["TV_PROPTEST_SEED", "PROPTEST_RNG_SEED"]
        .iter()
        .find_map(|key| std::env::var(key).ok()?.parse::<u64>().ok())
}

#[must_use]
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig::with_cases(property_test_case_count())
}

// ── JSON fixtures ──────────────────────────────────────────────────

/// JSON form of a fixture tree: numbers and booleans are scalar leaves,
/// `{"array": [...], "shape": [...]}` objects are tensor leaves, lists map
/// to list nodes and other objects to dict nodes. `null` is an empty node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixtureTree {
    Array(FixtureArray),
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<FixtureTree>),
    Dict(BTreeMap<String, FixtureTree>),
    Null(()),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureArray {
    pub array: Vec<f64>,
    pub shape: Vec<u32>,
    #[serde(default)]
    pub dtype: Option<String>,
}

#[derive(Debug)]
pub enum FixtureError {
    Json(serde_json::Error),
    Array(String),
}

impl std::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "fixture json: {err}"),
            Self::Array(detail) => write!(f, "fixture array: {detail}"),
        }
    }
}

impl std::error::Error for FixtureError {}

impl From<serde_json::Error> for FixtureError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl FixtureTree {
    pub fn into_tree(self) -> Result<Tree, FixtureError> {
        Ok(match self {
            Self::Bool(b) => Tree::leaf(Value::scalar_bool(b)),
            Self::Int(i) => Tree::leaf(Value::scalar_i64(i)),
            Self::Float(x) => Tree::leaf(Value::scalar_f64(x)),
            Self::Null(()) => Tree::None,
            Self::List(items) => Tree::List(
                items
                    .into_iter()
                    .map(Self::into_tree)
                    .collect::<Result<_, _>>()?,
            ),
            Self::Dict(entries) => Tree::Dict(
                entries
                    .into_iter()
                    .map(|(key, child)| child.into_tree().map(|tree| (key, tree)))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Array(array) => Tree::leaf(array.into_value()?),
        })
    }
}

impl FixtureArray {
    pub fn into_value(self) -> Result<Value, FixtureError> {
        let dtype = match self.dtype.as_deref() {
            None => DType::F64,
            Some(raw) => DType::parse(raw)
                .ok_or_else(|| FixtureError::Array(format!("unknown dtype '{raw}'")))?,
        };
        let elements = self
            .array
            .into_iter()
            .map(|x| Literal::from_f64(x).cast(dtype))
            .collect();
        Value::from_parts(dtype, Shape::new(self.shape), elements)
            .map_err(|err| FixtureError::Array(err.to_string()))
    }
}

/// Parses a JSON fixture into a [`Tree`].
pub fn tree_from_json(raw: &str) -> Result<Tree, FixtureError> {
    serde_json::from_str::<FixtureTree>(raw)?.into_tree()
}

// ── Comparison ─────────────────────────────────────────────────────

/// Element-wise comparison with an absolute tolerance on floats; shapes and
/// dtypes must match exactly.
#[must_use]
pub fn values_close(lhs: &Value, rhs: &Value, tolerance: f64) -> bool {
    if lhs.dtype() != rhs.dtype() || lhs.shape() != rhs.shape() {
        return false;
    }
    lhs.elements()
        .iter()
        .zip(rhs.elements())
        .all(|(a, b)| match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if a.dtype() == DType::F64 => {
                (x.is_nan() && y.is_nan()) || (x - y).abs() <= tolerance
            }
            _ => a == b,
        })
}

/// [`values_close`] lifted over two trees of the same structure.
#[must_use]
pub fn trees_close(lhs: &Tree, rhs: &Tree, tolerance: f64) -> bool {
    match (lhs, rhs) {
        (Tree::Leaf(a), Tree::Leaf(b)) => values_close(a, b, tolerance),
        (Tree::None, Tree::None) => true,
        (Tree::Tuple(a), Tree::Tuple(b)) | (Tree::List(a), Tree::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| trees_close(x, y, tolerance))
        }
        (Tree::Dict(a), Tree::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|((ka, x), (kb, y))| ka == kb && trees_close(x, y, tolerance))
        }
        _ => false,
    }
}

// ── Strategies ─────────────────────────────────────────────────────

/// Small integers so sums and products stay exact.
pub fn arb_small_i64() -> impl Strategy<Value = i64> {
    -8_i64..=8
}

pub fn arb_f64_vector(max_len: usize) -> impl Strategy<Value = Value> {
    prop::collection::vec(-4.0_f64..4.0, 1..=max_len).prop_map(|xs| {
        let dims = [xs.len() as u32];
        tensor_f64(&dims, &xs)
    })
}

/// A scalar, vector or matrix of small f64 values.
pub fn arb_f64_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-4.0_f64..4.0).prop_map(Value::scalar_f64),
        arb_f64_vector(4),
        (1_u32..=3, 1_u32..=3).prop_flat_map(|(rows, cols)| {
            prop::collection::vec(-4.0_f64..4.0, (rows * cols) as usize)
                .prop_map(move |xs| tensor_f64(&[rows, cols], &xs))
        }),
    ]
}

/// Small nested trees of f64 leaves with at least one leaf.
pub fn arb_f64_tree() -> impl Strategy<Value = Tree> {
    let leaf = arb_f64_leaf().prop_map(Tree::Leaf);
    leaf.prop_recursive(3, 12, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..=3).prop_map(Tree::Tuple),
            prop::collection::vec(inner.clone(), 1..=3).prop_map(Tree::List),
            prop::collection::btree_map("[a-d]", inner, 1..=3).prop_map(Tree::Dict),
        ]
    })
}

/// Builds an f64 tensor; the strategies above only produce consistent
/// shapes, so a failure here is a strategy bug.
fn tensor_f64(dims: &[u32], values: &[f64]) -> Value {
    let elements = values.iter().copied().map(Literal::from_f64).collect();
    match TensorValue::new(DType::F64, Shape::new(dims.to_vec()), elements) {
        Ok(tensor) => Value::Tensor(tensor),
        Err(_) => Value::scalar_f64(0.0),
    }
}

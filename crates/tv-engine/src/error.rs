#![forbid(unsafe_code)]

use tv_core::{Primitive, ValueError};
use tv_lax::EvalError;
use tv_tree::UnflattenError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Operands carry different non-trivial container descriptors on one axis.
    ConflictingStructure { axis: usize, detail: String },
    /// Operands carry different multi-segment layouts on one axis.
    ConflictingShape { axis: usize, detail: String },
    /// Logical axis lengths cannot be reconciled.
    ShapeMismatch {
        axis: usize,
        expected: u64,
        actual: u64,
    },
    InvalidConcatenateAxis { axis: usize, detail: String },
    InvalidSqueezeAxis { axis: usize, detail: String },
    InvalidBroadcastAxis { axis: usize, detail: String },
    UnsupportedPrimitive(Primitive),
    RankMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    InvalidParam { key: String, detail: String },
    /// A structured value violates its construction invariants.
    InvalidStructure(String),
    NotALeaf(String),
    Container(UnflattenError),
    Kernel(EvalError),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConflictingStructure { axis, detail } => {
                write!(f, "conflicting container structure along axis {axis}: {detail}")
            }
            Self::ConflictingShape { axis, detail } => {
                write!(f, "conflicting segment shapes along axis {axis}: {detail}")
            }
            Self::ShapeMismatch {
                axis,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "axis {axis} length mismatch: expected {expected}, got {actual}"
                )
            }
            Self::InvalidConcatenateAxis { axis, detail } => {
                write!(f, "cannot concatenate along axis {axis}: {detail}")
            }
            Self::InvalidSqueezeAxis { axis, detail } => {
                write!(f, "cannot squeeze axis {axis}: {detail}")
            }
            Self::InvalidBroadcastAxis { axis, detail } => {
                write!(f, "cannot broadcast axis {axis}: {detail}")
            }
            Self::UnsupportedPrimitive(primitive) => {
                write!(f, "no tree rule for primitive: {}", primitive.as_str())
            }
            Self::RankMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "rank mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    primitive.as_str(),
                    expected,
                    actual
                )
            }
            Self::InvalidParam { key, detail } => {
                write!(f, "invalid param '{key}': {detail}")
            }
            Self::InvalidStructure(detail) => write!(f, "invalid structured value: {detail}"),
            Self::NotALeaf(descriptor) => {
                write!(f, "expected a bare leaf, got container {descriptor}")
            }
            Self::Container(err) => write!(f, "container error: {err}"),
            Self::Kernel(err) => write!(f, "kernel error: {err}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Container(err) => Some(err),
            Self::Kernel(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EvalError> for TreeError {
    fn from(value: EvalError) -> Self {
        Self::Kernel(value)
    }
}

impl From<ValueError> for TreeError {
    fn from(value: ValueError) -> Self {
        Self::Kernel(EvalError::InvalidTensor(value))
    }
}

impl From<UnflattenError> for TreeError {
    fn from(value: UnflattenError) -> Self {
        Self::Container(value)
    }
}

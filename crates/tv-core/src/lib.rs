#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I64,
    F64,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I64 => "i64",
            Self::F64 => "f64",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "bool" => Some(Self::Bool),
            "i64" | "int64" => Some(Self::I64),
            "f64" | "float64" => Some(Self::F64),
            _ => None,
        }
    }

    /// Smallest dtype both operands can be represented in (bool < i64 < f64).
    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn new(dims: Vec<u32>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }

    #[must_use]
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Shape>) -> Self {
        let mut dims = Vec::new();
        for part in parts {
            dims.extend_from_slice(&part.dims);
        }
        Self { dims }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        if self.dims.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Primitive {
    // Identity
    Copy,
    // Unary arithmetic
    Neg,
    Abs,
    Sign,
    Floor,
    Ceil,
    Round,
    Exp,
    Log,
    Expm1,
    Log1p,
    Sqrt,
    Rsqrt,
    Square,
    Reciprocal,
    Logistic,
    // Trigonometric / hyperbolic
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    // Predicates and casts
    IsFinite,
    Not,
    ConvertElementType,
    // Binary arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Max,
    Min,
    Atan2,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical / bitwise
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
    // Ternary
    Select,
    Clamp,
    // Reduction
    ReduceSum,
    ReduceProd,
    ReduceMax,
    ReduceMin,
    ReduceOr,
    ReduceAnd,
    // Shape manipulation
    Concatenate,
    BroadcastInDim,
    ExpandDims,
    Squeeze,
    Transpose,
    Reshape,
    Slice,
    // Contraction
    DotGeneral,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sign => "sign",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Round => "round",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Expm1 => "expm1",
            Self::Log1p => "log1p",
            Self::Sqrt => "sqrt",
            Self::Rsqrt => "rsqrt",
            Self::Square => "square",
            Self::Reciprocal => "reciprocal",
            Self::Logistic => "logistic",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::IsFinite => "is_finite",
            Self::Not => "not",
            Self::ConvertElementType => "convert_element_type",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::Pow => "pow",
            Self::Max => "max",
            Self::Min => "min",
            Self::Atan2 => "atan2",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::ShiftLeft => "shift_left",
            Self::ShiftRight => "shift_right",
            Self::Select => "select",
            Self::Clamp => "clamp",
            Self::ReduceSum => "reduce_sum",
            Self::ReduceProd => "reduce_prod",
            Self::ReduceMax => "reduce_max",
            Self::ReduceMin => "reduce_min",
            Self::ReduceOr => "reduce_or",
            Self::ReduceAnd => "reduce_and",
            Self::Concatenate => "concatenate",
            Self::BroadcastInDim => "broadcast_in_dim",
            Self::ExpandDims => "expand_dims",
            Self::Squeeze => "squeeze",
            Self::Transpose => "transpose",
            Self::Reshape => "reshape",
            Self::Slice => "slice",
            Self::DotGeneral => "dot_general",
        }
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::I64(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I64(_))
    }

    /// Converts to `dtype` the way a numeric cast would (truncating floats,
    /// mapping non-zero to `true`).
    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        match (self, dtype) {
            (Self::Bool(b), DType::Bool) => Self::Bool(b),
            (Self::Bool(b), DType::I64) => Self::I64(i64::from(b)),
            (Self::Bool(b), DType::F64) => Self::from_f64(if b { 1.0 } else { 0.0 }),
            (Self::I64(v), DType::Bool) => Self::Bool(v != 0),
            (Self::I64(v), DType::I64) => Self::I64(v),
            (Self::I64(v), DType::F64) => Self::from_f64(v as f64),
            (Self::F64Bits(bits), DType::Bool) => Self::Bool(f64::from_bits(bits) != 0.0),
            (Self::F64Bits(bits), DType::I64) => Self::I64(f64::from_bits(bits) as i64),
            (Self::F64Bits(bits), DType::F64) => Self::F64Bits(bits),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .copied()
            .map(Literal::from_f64)
            .collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::new(
            DType::F64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn tensor_f64(dims: &[u32], values: &[f64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::from_f64).collect();
        Self::from_parts(DType::F64, Shape::new(dims.to_vec()), elements)
    }

    pub fn tensor_i64(dims: &[u32], values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect();
        Self::from_parts(DType::I64, Shape::new(dims.to_vec()), elements)
    }

    /// Builds a value from raw parts, collapsing rank-0 shapes to `Scalar`.
    pub fn from_parts(
        dtype: DType,
        shape: Shape,
        elements: Vec<Literal>,
    ) -> Result<Self, ValueError> {
        if shape.rank() == 0 {
            if elements.len() != 1 {
                return Err(ValueError::ElementCountMismatch {
                    shape,
                    expected_count: 1,
                    actual_count: elements.len(),
                });
            }
            return Ok(Self::Scalar(elements[0].cast(dtype)));
        }
        Ok(Self::Tensor(TensorValue::new(dtype, shape, elements)?))
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.dtype(),
            Self::Tensor(tensor) => tensor.dtype,
        }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) => Shape::scalar(),
            Self::Tensor(tensor) => tensor.shape.clone(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Tensor(tensor) => tensor.rank(),
        }
    }

    /// Row-major element view; a scalar is a one-element slice.
    #[must_use]
    pub fn elements(&self) -> &[Literal] {
        match self {
            Self::Scalar(lit) => std::slice::from_ref(lit),
            Self::Tensor(tensor) => &tensor.elements,
        }
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    /// Element values as f64, `None` if any element is boolean.
    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements().iter().copied().map(Literal::as_f64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        if let Some(found) = elements.iter().find(|lit| lit.dtype() != dtype) {
            return Err(ValueError::ElementDTypeMismatch {
                expected: dtype,
                actual: found.dtype(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }
}

/// Malformed tensor construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    ElementDTypeMismatch {
        expected: DType,
        actual: DType,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => write!(f, "element count of {shape} overflows"),
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => write!(
                f,
                "shape {shape} holds {expected_count} elements, {actual_count} were given"
            ),
            Self::ElementDTypeMismatch { expected, actual } => write!(
                f,
                "{} element in a {} tensor",
                actual.as_str(),
                expected.as_str()
            ),
        }
    }
}

impl std::error::Error for ValueError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    pub params: BTreeMap<String, String>,
}

/// A straight-line program: inputs, equations in evaluation order, outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jaxpr {
    pub invars: Vec<VarId>,
    pub outvars: Vec<VarId>,
    pub equations: Vec<Equation>,
}

/// Why a program is not well formed. `equation_index` is `None` for program
/// inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JaxprValidationError {
    /// A variable is bound twice, or listed twice among the outputs.
    Rebound {
        equation_index: Option<usize>,
        var: VarId,
    },
    UnboundInputVar {
        equation_index: usize,
        var: VarId,
    },
    UnknownOutvar {
        var: VarId,
    },
}

impl std::fmt::Display for JaxprValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rebound {
                equation_index: Some(index),
                var,
            } => write!(f, "equation {index} rebinds v{}", var.0),
            Self::Rebound {
                equation_index: None,
                var,
            } => write!(f, "v{} appears twice in the program signature", var.0),
            Self::UnboundInputVar {
                equation_index,
                var,
            } => write!(f, "equation {equation_index} reads v{} before it is bound", var.0),
            Self::UnknownOutvar { var } => write!(f, "output v{} is never bound", var.0),
        }
    }
}

impl std::error::Error for JaxprValidationError {}

impl Jaxpr {
    #[must_use]
    pub fn new(invars: Vec<VarId>, outvars: Vec<VarId>, equations: Vec<Equation>) -> Self {
        Self {
            invars,
            outvars,
            equations,
        }
    }

    /// Every variable is bound once, read only after it is bound, and every
    /// output names a bound variable.
    pub fn validate_well_formed(&self) -> Result<(), JaxprValidationError> {
        let mut bound = BTreeSet::new();
        if let Some(&var) = self.invars.iter().find(|&&var| !bound.insert(var)) {
            return Err(JaxprValidationError::Rebound {
                equation_index: None,
                var,
            });
        }

        for (index, eqn) in self.equations.iter().enumerate() {
            let unbound = eqn.inputs.iter().find_map(|atom| match atom {
                Atom::Var(var) if !bound.contains(var) => Some(*var),
                _ => None,
            });
            if let Some(var) = unbound {
                return Err(JaxprValidationError::UnboundInputVar {
                    equation_index: index,
                    var,
                });
            }
            for &var in &eqn.outputs {
                if !bound.insert(var) {
                    return Err(JaxprValidationError::Rebound {
                        equation_index: Some(index),
                        var,
                    });
                }
            }
        }

        let mut listed = BTreeSet::new();
        for &var in &self.outvars {
            if !bound.contains(&var) {
                return Err(JaxprValidationError::UnknownOutvar { var });
            }
            if !listed.insert(var) {
                return Err(JaxprValidationError::Rebound {
                    equation_index: None,
                    var,
                });
            }
        }
        Ok(())
    }
}

/// Canned programs used by tests, benches and the interpreter smoke checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramSpec {
    /// `x + y`
    Add2,
    /// `x + 1`
    AddOne,
    /// `x * x`
    Square,
    /// `reduce_sum(x, axes=0)` for a rank-1 input.
    SumVec,
    /// `dot_general(x, y)` contracting axis 0 of two rank-1 inputs.
    DotVec,
    /// `expand_dims(x, 1) + expand_dims(y, 0)`
    AddOuter,
    /// `concatenate([expand_dims(x, 0), expand_dims(y, 0)], 0)`
    Stack2,
}

fn params_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
        .collect()
}

fn equation(
    primitive: Primitive,
    inputs: SmallVec<[Atom; 4]>,
    output: VarId,
    params: BTreeMap<String, String>,
) -> Equation {
    Equation {
        primitive,
        inputs,
        outputs: smallvec![output],
        params,
    }
}

#[must_use]
pub fn build_program(spec: ProgramSpec) -> Jaxpr {
    let (v1, v2, v3, v4, v5) = (VarId(1), VarId(2), VarId(3), VarId(4), VarId(5));
    match spec {
        ProgramSpec::Add2 => Jaxpr::new(
            vec![v1, v2],
            vec![v3],
            vec![equation(
                Primitive::Add,
                smallvec![Atom::Var(v1), Atom::Var(v2)],
                v3,
                BTreeMap::new(),
            )],
        ),
        ProgramSpec::AddOne => Jaxpr::new(
            vec![v1],
            vec![v2],
            vec![equation(
                Primitive::Add,
                smallvec![Atom::Var(v1), Atom::Lit(Literal::I64(1))],
                v2,
                BTreeMap::new(),
            )],
        ),
        ProgramSpec::Square => Jaxpr::new(
            vec![v1],
            vec![v2],
            vec![equation(
                Primitive::Mul,
                smallvec![Atom::Var(v1), Atom::Var(v1)],
                v2,
                BTreeMap::new(),
            )],
        ),
        ProgramSpec::SumVec => Jaxpr::new(
            vec![v1],
            vec![v2],
            vec![equation(
                Primitive::ReduceSum,
                smallvec![Atom::Var(v1)],
                v2,
                params_of(&[("axes", "0")]),
            )],
        ),
        ProgramSpec::DotVec => Jaxpr::new(
            vec![v1, v2],
            vec![v3],
            vec![equation(
                Primitive::DotGeneral,
                smallvec![Atom::Var(v1), Atom::Var(v2)],
                v3,
                params_of(&[
                    ("lhs_contracting_dimensions", "0"),
                    ("rhs_contracting_dimensions", "0"),
                    ("lhs_batch_dimensions", ""),
                    ("rhs_batch_dimensions", ""),
                ]),
            )],
        ),
        ProgramSpec::AddOuter => Jaxpr::new(
            vec![v1, v2],
            vec![v5],
            vec![
                equation(
                    Primitive::ExpandDims,
                    smallvec![Atom::Var(v1)],
                    v3,
                    params_of(&[("dimensions", "1")]),
                ),
                equation(
                    Primitive::ExpandDims,
                    smallvec![Atom::Var(v2)],
                    v4,
                    params_of(&[("dimensions", "0")]),
                ),
                equation(
                    Primitive::Add,
                    smallvec![Atom::Var(v3), Atom::Var(v4)],
                    v5,
                    BTreeMap::new(),
                ),
            ],
        ),
        ProgramSpec::Stack2 => Jaxpr::new(
            vec![v1, v2],
            vec![v5],
            vec![
                equation(
                    Primitive::ExpandDims,
                    smallvec![Atom::Var(v1)],
                    v3,
                    params_of(&[("dimensions", "0")]),
                ),
                equation(
                    Primitive::ExpandDims,
                    smallvec![Atom::Var(v2)],
                    v4,
                    params_of(&[("dimensions", "0")]),
                ),
                equation(
                    Primitive::Concatenate,
                    smallvec![Atom::Var(v3), Atom::Var(v4)],
                    v5,
                    params_of(&[("dimension", "0")]),
                ),
            ],
        ),
    }
}

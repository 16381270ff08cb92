#![forbid(unsafe_code)]

mod arithmetic;
mod comparison;
mod reduction;
mod tensor_ops;
mod type_promotion;

use std::collections::BTreeMap;
use tv_core::{Primitive, Shape, Value, ValueError};

use arithmetic::{
    eval_atan2, eval_binary_arith, eval_clamp, eval_convert_element_type, eval_dot_general,
    eval_extremum, eval_is_finite, eval_logical, eval_not, eval_select, eval_shift, eval_unary_float,
    eval_unary_int_or_float,
};
use comparison::eval_comparison;
use reduction::{ReduceOp, eval_reduce_axes};
use tensor_ops::{
    eval_broadcast_in_dim, eval_concatenate, eval_expand_dims, eval_reshape, eval_slice,
    eval_squeeze, eval_transpose,
};

pub use tensor_ops::{row_major_strides, unravel_index};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        primitive: Primitive,
        detail: &'static str,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    Unsupported {
        primitive: Primitive,
        detail: String,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => write!(f, "{primitive} takes {expected} input(s), got {actual}"),
            Self::TypeMismatch { primitive, detail } => write!(f, "{primitive}: {detail}"),
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => write!(f, "{primitive}: incompatible shapes {left} and {right}"),
            Self::Unsupported { primitive, detail } => {
                write!(f, "{primitive} does not support {detail}")
            }
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidTensor(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

/// Parses a comma-separated list of non-negative integers. An empty (or
/// all-whitespace) string is the empty list.
#[must_use]
pub fn parse_usize_list(raw: &str) -> Option<Vec<usize>> {
    if raw.trim().is_empty() {
        return Some(Vec::new());
    }
    raw.split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect()
}

/// Renders a list in the form accepted by [`parse_usize_list`].
#[must_use]
pub fn format_usize_list(values: &[usize]) -> String {
    values
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn check_arity(
    primitive: Primitive,
    inputs: &[Value],
    expected: usize,
) -> Result<(), EvalError> {
    if inputs.len() != expected {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn float_sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        x
    }
}

#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    match primitive {
        Primitive::Copy => {
            check_arity(primitive, inputs, 1)?;
            Ok(inputs[0].clone())
        }
        // Unary, integer-preserving
        Primitive::Neg => eval_unary_int_or_float(
            primitive,
            inputs,
            i64::checked_neg,
            |x| -x,
        ),
        Primitive::Abs => eval_unary_int_or_float(primitive, inputs, i64::checked_abs, f64::abs),
        Primitive::Sign => {
            eval_unary_int_or_float(primitive, inputs, |x| Some(x.signum()), float_sign)
        }
        Primitive::Floor => eval_unary_int_or_float(primitive, inputs, Some, f64::floor),
        Primitive::Ceil => eval_unary_int_or_float(primitive, inputs, Some, f64::ceil),
        Primitive::Round => eval_unary_int_or_float(primitive, inputs, Some, f64::round),
        Primitive::Square => {
            eval_unary_int_or_float(primitive, inputs, |x| x.checked_mul(x), |x| x * x)
        }
        // Unary, always floating
        Primitive::Exp => eval_unary_float(primitive, inputs, f64::exp),
        Primitive::Log => eval_unary_float(primitive, inputs, f64::ln),
        Primitive::Expm1 => eval_unary_float(primitive, inputs, f64::exp_m1),
        Primitive::Log1p => eval_unary_float(primitive, inputs, f64::ln_1p),
        Primitive::Sqrt => eval_unary_float(primitive, inputs, f64::sqrt),
        Primitive::Rsqrt => eval_unary_float(primitive, inputs, |x| 1.0 / x.sqrt()),
        Primitive::Reciprocal => eval_unary_float(primitive, inputs, |x| 1.0 / x),
        Primitive::Logistic => eval_unary_float(primitive, inputs, logistic),
        Primitive::Sin => eval_unary_float(primitive, inputs, f64::sin),
        Primitive::Cos => eval_unary_float(primitive, inputs, f64::cos),
        Primitive::Tan => eval_unary_float(primitive, inputs, f64::tan),
        Primitive::Sinh => eval_unary_float(primitive, inputs, f64::sinh),
        Primitive::Cosh => eval_unary_float(primitive, inputs, f64::cosh),
        Primitive::Tanh => eval_unary_float(primitive, inputs, f64::tanh),
        Primitive::IsFinite => eval_is_finite(inputs),
        Primitive::Not => eval_not(inputs),
        Primitive::ConvertElementType => eval_convert_element_type(inputs, params),
        // Binary arithmetic
        Primitive::Add => {
            eval_binary_arith(primitive, inputs, i64::checked_add, |a, b| a + b)
        }
        Primitive::Sub => {
            eval_binary_arith(primitive, inputs, i64::checked_sub, |a, b| a - b)
        }
        Primitive::Mul => {
            eval_binary_arith(primitive, inputs, i64::checked_mul, |a, b| a * b)
        }
        Primitive::Div => {
            eval_binary_arith(primitive, inputs, i64::checked_div, |a, b| a / b)
        }
        Primitive::Rem => {
            eval_binary_arith(primitive, inputs, i64::checked_rem, |a, b| a % b)
        }
        Primitive::Pow => eval_binary_arith(
            primitive,
            inputs,
            |a, b| match u32::try_from(b) {
                Ok(exp) => a.checked_pow(exp),
                Err(_) => Some((a as f64).powf(b as f64) as i64),
            },
            f64::powf,
        ),
        Primitive::Max => eval_extremum(primitive, inputs, true),
        Primitive::Min => eval_extremum(primitive, inputs, false),
        Primitive::Atan2 => eval_atan2(inputs),
        // Comparison
        Primitive::Eq => eval_comparison(primitive, inputs, |a, b| a == b, |a, b| a == b),
        Primitive::Ne => eval_comparison(primitive, inputs, |a, b| a != b, |a, b| a != b),
        Primitive::Lt => eval_comparison(primitive, inputs, |a, b| a < b, |a, b| a < b),
        Primitive::Le => eval_comparison(primitive, inputs, |a, b| a <= b, |a, b| a <= b),
        Primitive::Gt => eval_comparison(primitive, inputs, |a, b| a > b, |a, b| a > b),
        Primitive::Ge => eval_comparison(primitive, inputs, |a, b| a >= b, |a, b| a >= b),
        // Logical / bitwise
        Primitive::And => eval_logical(primitive, inputs, |a, b| a & b, |a, b| a & b),
        Primitive::Or => eval_logical(primitive, inputs, |a, b| a | b, |a, b| a | b),
        Primitive::Xor => eval_logical(primitive, inputs, |a, b| a ^ b, |a, b| a ^ b),
        Primitive::ShiftLeft => eval_shift(primitive, inputs, |a, s| {
            if s >= 64 { 0 } else { a.wrapping_shl(s) }
        }),
        Primitive::ShiftRight => eval_shift(primitive, inputs, |a, s| a >> s.min(63)),
        // Ternary
        Primitive::Select => eval_select(inputs),
        Primitive::Clamp => eval_clamp(inputs),
        // Reduction
        Primitive::ReduceSum => eval_reduce_axes(primitive, inputs, params, ReduceOp::Sum),
        Primitive::ReduceProd => eval_reduce_axes(primitive, inputs, params, ReduceOp::Prod),
        Primitive::ReduceMax => eval_reduce_axes(primitive, inputs, params, ReduceOp::Max),
        Primitive::ReduceMin => eval_reduce_axes(primitive, inputs, params, ReduceOp::Min),
        Primitive::ReduceOr => eval_reduce_axes(primitive, inputs, params, ReduceOp::Or),
        Primitive::ReduceAnd => eval_reduce_axes(primitive, inputs, params, ReduceOp::And),
        // Shape manipulation
        Primitive::Concatenate => eval_concatenate(inputs, params),
        Primitive::BroadcastInDim => eval_broadcast_in_dim(inputs, params),
        Primitive::ExpandDims => eval_expand_dims(inputs, params),
        Primitive::Squeeze => eval_squeeze(inputs, params),
        Primitive::Transpose => eval_transpose(inputs, params),
        Primitive::Reshape => eval_reshape(inputs, params),
        Primitive::Slice => eval_slice(inputs, params),
        // Contraction
        Primitive::DotGeneral => eval_dot_general(inputs, params),
    }
}

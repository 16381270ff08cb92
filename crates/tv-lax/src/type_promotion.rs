#![forbid(unsafe_code)]

use tv_core::{DType, Literal, Primitive, Value};

use crate::EvalError;

/// Common dtype of all operands. Output dtypes are derived from operand
/// dtypes rather than from element values so empty blocks keep their type.
#[inline]
pub(crate) fn result_dtype(inputs: &[Value]) -> DType {
    inputs
        .iter()
        .map(Value::dtype)
        .reduce(DType::promote)
        .unwrap_or(DType::F64)
}

/// Arithmetic never runs on booleans; they widen to i64 first.
#[inline]
pub(crate) fn arithmetic_dtype(dtype: DType) -> DType {
    match dtype {
        DType::Bool => DType::I64,
        other => other,
    }
}

/// Apply a binary operation to two literals already cast to `dtype`.
#[inline]
pub(crate) fn binary_literal_op(
    lhs: Literal,
    rhs: Literal,
    dtype: DType,
    primitive: Primitive,
    int_op: &impl Fn(i64, i64) -> Option<i64>,
    float_op: &impl Fn(f64, f64) -> f64,
) -> Result<Literal, EvalError> {
    match (lhs.cast(dtype), rhs.cast(dtype)) {
        (Literal::I64(left), Literal::I64(right)) => {
            int_op(left, right)
                .map(Literal::I64)
                .ok_or(EvalError::TypeMismatch {
                    primitive,
                    detail: "integer overflow or division by zero",
                })
        }
        (left, right) => {
            let lhs_f = left.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric lhs",
            })?;
            let rhs_f = right.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric rhs",
            })?;
            Ok(Literal::from_f64(float_op(lhs_f, rhs_f)))
        }
    }
}

/// Compare two literals after promoting both to `dtype`.
#[inline]
pub(crate) fn compare_literals(
    lhs: Literal,
    rhs: Literal,
    dtype: DType,
    primitive: Primitive,
    int_cmp: &impl Fn(i64, i64) -> bool,
    float_cmp: &impl Fn(f64, f64) -> bool,
) -> Result<bool, EvalError> {
    match (lhs.cast(dtype), rhs.cast(dtype)) {
        (Literal::I64(a), Literal::I64(b)) => Ok(int_cmp(a, b)),
        (Literal::Bool(a), Literal::Bool(b)) => Ok(int_cmp(i64::from(a), i64::from(b))),
        (left, right) => {
            let lhs_f = left.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric lhs for comparison",
            })?;
            let rhs_f = right.as_f64().ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric rhs for comparison",
            })?;
            Ok(float_cmp(lhs_f, rhs_f))
        }
    }
}

/// `acc + lhs * rhs` in `dtype`, wrapping on integer overflow.
#[inline]
pub(crate) fn multiply_accumulate(acc: Literal, lhs: Literal, rhs: Literal, dtype: DType) -> Literal {
    match dtype {
        DType::F64 => {
            let a = acc.cast(DType::F64).as_f64().unwrap_or(0.0);
            let l = lhs.cast(DType::F64).as_f64().unwrap_or(0.0);
            let r = rhs.cast(DType::F64).as_f64().unwrap_or(0.0);
            Literal::from_f64(a + l * r)
        }
        DType::I64 | DType::Bool => {
            let a = acc.cast(DType::I64).as_i64().unwrap_or(0);
            let l = lhs.cast(DType::I64).as_i64().unwrap_or(0);
            let r = rhs.cast(DType::I64).as_i64().unwrap_or(0);
            Literal::I64(a.wrapping_add(l.wrapping_mul(r)))
        }
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::{DType, Literal, Primitive, Shape, Value};

use crate::EvalError;
use crate::check_arity;
use crate::tensor_ops::{parse_usize_param, row_major_strides, unravel_index};
use crate::type_promotion::arithmetic_dtype;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    Or,
    And,
}

impl ReduceOp {
    /// dtype the accumulator runs in and the dtype of the result.
    fn dtypes(self, primitive: Primitive, input: DType) -> Result<(DType, DType), EvalError> {
        match self {
            Self::Sum | Self::Prod => {
                let work = arithmetic_dtype(input);
                Ok((work, work))
            }
            Self::Max | Self::Min => Ok((input, input)),
            Self::Or | Self::And => {
                if input == DType::F64 {
                    Err(EvalError::TypeMismatch {
                        primitive,
                        detail: "logical reduction requires bool or integer operand",
                    })
                } else {
                    Ok((input, input))
                }
            }
        }
    }

    fn identity(self, dtype: DType) -> Literal {
        match (self, dtype) {
            (Self::Sum, DType::F64) => Literal::from_f64(0.0),
            (Self::Prod, DType::F64) => Literal::from_f64(1.0),
            (Self::Max, DType::F64) => Literal::from_f64(f64::NEG_INFINITY),
            (Self::Min, DType::F64) => Literal::from_f64(f64::INFINITY),
            (Self::Max, DType::Bool) => Literal::Bool(false),
            (Self::Min, DType::Bool) => Literal::Bool(true),
            (Self::Sum, _) => Literal::I64(0),
            (Self::Prod, _) => Literal::I64(1),
            (Self::Max, _) => Literal::I64(i64::MIN),
            (Self::Min, _) => Literal::I64(i64::MAX),
            (Self::Or, DType::Bool) => Literal::Bool(false),
            (Self::And, DType::Bool) => Literal::Bool(true),
            (Self::Or, _) => Literal::I64(0),
            (Self::And, _) => Literal::I64(-1),
        }
    }

    fn combine(self, acc: Literal, value: Literal) -> Literal {
        match (acc, value) {
            (Literal::F64Bits(a), Literal::F64Bits(b)) => {
                let (a, b) = (f64::from_bits(a), f64::from_bits(b));
                Literal::from_f64(match self {
                    Self::Sum => a + b,
                    Self::Prod => a * b,
                    Self::Max => a.max(b),
                    Self::Min => a.min(b),
                    Self::Or | Self::And => a,
                })
            }
            (Literal::I64(a), Literal::I64(b)) => Literal::I64(match self {
                Self::Sum => a.wrapping_add(b),
                Self::Prod => a.wrapping_mul(b),
                Self::Max => a.max(b),
                Self::Min => a.min(b),
                Self::Or => a | b,
                Self::And => a & b,
            }),
            (Literal::Bool(a), Literal::Bool(b)) => Literal::Bool(match self {
                Self::Or | Self::Max => a || b,
                Self::And | Self::Min => a && b,
                Self::Sum | Self::Prod => a,
            }),
            (acc, _) => acc,
        }
    }
}

/// Axis-aware reduction. Params: `axes` (comma-separated). A missing `axes`
/// param reduces every axis; an empty list reduces nothing.
pub(crate) fn eval_reduce_axes(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
    op: ReduceOp,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 1)?;
    let input = &inputs[0];
    let shape = input.shape();
    let rank = shape.rank();

    let axes = if params.contains_key("axes") {
        parse_usize_param(primitive, "axes", params)?
    } else {
        (0..rank).collect()
    };
    if let Some(&bad) = axes.iter().find(|&&axis| axis >= rank) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("reduction axis {bad} out of range for rank {rank}"),
        });
    }

    let (work, out_dtype) = op.dtypes(primitive, input.dtype())?;
    let kept = (0..rank)
        .filter(|axis| !axes.contains(axis))
        .collect::<Vec<_>>();
    let out_dims = kept.iter().map(|&axis| shape.dims[axis]).collect::<Vec<_>>();
    let out_strides = row_major_strides(&out_dims);
    let out_count = out_dims.iter().map(|&d| d as usize).product::<usize>();

    let mut acc = vec![op.identity(work); out_count];
    for (flat, &literal) in input.elements().iter().enumerate() {
        let multi = unravel_index(flat, &shape.dims);
        let out_flat = kept
            .iter()
            .zip(&out_strides)
            .map(|(&axis, stride)| multi[axis] * stride)
            .sum::<usize>();
        acc[out_flat] = op.combine(acc[out_flat], literal.cast(work));
    }

    let elements = acc.into_iter().map(|lit| lit.cast(out_dtype)).collect();
    Ok(Value::from_parts(out_dtype, Shape::new(out_dims), elements)?)
}

#[cfg(test)]
mod tests {
    use super::{ReduceOp, eval_reduce_axes};
    use std::collections::BTreeMap;
    use tv_core::{DType, Primitive, Value};

    fn axes(raw: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("axes".to_owned(), raw.to_owned());
        params
    }

    #[test]
    fn sum_over_leading_axis() {
        let x = Value::tensor_i64(&[2, 3], &[1, 2, 3, 4, 5, 6]).expect("x");
        let out = eval_reduce_axes(Primitive::ReduceSum, &[x], &axes("0"), ReduceOp::Sum)
            .expect("sum");
        assert_eq!(out, Value::vector_i64(&[5, 7, 9]).expect("expected"));
    }

    #[test]
    fn max_of_empty_float_axis_is_negative_infinity() {
        let x = Value::tensor_f64(&[0], &[]).expect("x");
        let out = eval_reduce_axes(Primitive::ReduceMax, &[x], &axes("0"), ReduceOp::Max)
            .expect("max");
        assert_eq!(out, Value::scalar_f64(f64::NEG_INFINITY));
    }

    #[test]
    fn bool_sum_counts_trues() {
        let x = Value::from_parts(
            DType::Bool,
            tv_core::Shape::vector(3),
            vec![
                tv_core::Literal::Bool(true),
                tv_core::Literal::Bool(false),
                tv_core::Literal::Bool(true),
            ],
        )
        .expect("x");
        let out = eval_reduce_axes(Primitive::ReduceSum, &[x], &BTreeMap::new(), ReduceOp::Sum)
            .expect("sum");
        assert_eq!(out, Value::scalar_i64(2));
    }

    #[test]
    fn reduction_axis_out_of_range() {
        let x = Value::vector_i64(&[1]).expect("x");
        let err = eval_reduce_axes(Primitive::ReduceMin, &[x], &axes("1"), ReduceOp::Min);
        assert!(err.is_err());
    }

    #[test]
    fn logical_reduction_rejects_floats() {
        let x = Value::vector_f64(&[1.0]).expect("x");
        let err = eval_reduce_axes(Primitive::ReduceOr, &[x], &BTreeMap::new(), ReduceOp::Or);
        assert!(err.is_err());
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::{DType, Literal, Primitive, Shape, Value, ValueError};

use crate::tensor_ops::{parse_usize_param, row_major_strides, unravel_index};
use crate::type_promotion::{
    arithmetic_dtype, binary_literal_op, multiply_accumulate, result_dtype,
};
use crate::{EvalError, check_arity};

/// NumPy broadcast of the operand shapes: ranks are right-aligned and every
/// dimension must be 1 or the common extent.
pub(crate) fn broadcast_shape(primitive: Primitive, inputs: &[Value]) -> Result<Shape, EvalError> {
    let rank = inputs.iter().map(Value::rank).max().unwrap_or(0);
    let mut dims = vec![1_u32; rank];
    for input in inputs {
        let shape = input.shape();
        let offset = rank - shape.rank();
        for (axis, &dim) in shape.dims.iter().enumerate() {
            let slot = &mut dims[offset + axis];
            if *slot == 1 {
                *slot = dim;
            } else if dim != 1 && dim != *slot {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: Shape::new(dims.clone()),
                    right: shape,
                });
            }
        }
    }
    Ok(Shape::new(dims))
}

/// Runs `op` once per output element with the (broadcast) operand elements
/// at that position. Results are cast to `out_dtype`.
pub(crate) fn eval_broadcasting(
    primitive: Primitive,
    inputs: &[Value],
    out_dtype: DType,
    op: impl Fn(&[Literal]) -> Result<Literal, EvalError>,
) -> Result<Value, EvalError> {
    let out_shape = broadcast_shape(primitive, inputs)?;
    let rank = out_shape.rank();
    let count = out_shape
        .element_count()
        .ok_or_else(|| ValueError::ShapeOverflow {
            shape: out_shape.clone(),
        })? as usize;

    let input_strides = inputs
        .iter()
        .map(|input| {
            let shape = input.shape();
            let own = row_major_strides(&shape.dims);
            let offset = rank - shape.rank();
            (0..rank)
                .map(|axis| {
                    if axis < offset || shape.dims[axis - offset] == 1 {
                        0
                    } else {
                        own[axis - offset]
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut args = Vec::with_capacity(inputs.len());
    let mut elements = Vec::with_capacity(count);
    for flat in 0..count {
        let multi = unravel_index(flat, &out_shape.dims);
        args.clear();
        for (input, strides) in inputs.iter().zip(&input_strides) {
            let offset = multi
                .iter()
                .zip(strides)
                .map(|(idx, stride)| idx * stride)
                .sum::<usize>();
            args.push(input.elements()[offset]);
        }
        elements.push(op(&args)?.cast(out_dtype));
    }
    Ok(Value::from_parts(out_dtype, out_shape, elements)?)
}

fn map_elements(
    value: &Value,
    dtype: DType,
    op: impl Fn(Literal) -> Result<Literal, EvalError>,
) -> Result<Value, EvalError> {
    let elements = value
        .elements()
        .iter()
        .copied()
        .map(|lit| op(lit).map(|out| out.cast(dtype)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::from_parts(dtype, value.shape(), elements)?)
}

/// Unary elementwise operation computed in f64 (exp, log, sqrt, ...).
pub(crate) fn eval_unary_float(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 1)?;
    map_elements(&inputs[0], DType::F64, |lit| {
        lit.as_f64()
            .map(|x| Literal::from_f64(op(x)))
            .ok_or(EvalError::TypeMismatch {
                primitive,
                detail: "expected numeric operand",
            })
    })
}

/// Unary elementwise operation that keeps integer operands integral.
pub(crate) fn eval_unary_int_or_float(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64) -> Option<i64>,
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 1)?;
    let dtype = inputs[0].dtype();
    if dtype == DType::Bool {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected numeric operand",
        });
    }
    map_elements(&inputs[0], dtype, |lit| match lit {
        Literal::I64(v) => int_op(v).map(Literal::I64).ok_or(EvalError::TypeMismatch {
            primitive,
            detail: "integer overflow",
        }),
        Literal::F64Bits(bits) => Ok(Literal::from_f64(float_op(f64::from_bits(bits)))),
        Literal::Bool(_) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected numeric operand",
        }),
    })
}

pub(crate) fn eval_is_finite(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::IsFinite;
    check_arity(primitive, inputs, 1)?;
    map_elements(&inputs[0], DType::Bool, |lit| match lit {
        Literal::F64Bits(bits) => Ok(Literal::Bool(f64::from_bits(bits).is_finite())),
        Literal::I64(_) => Ok(Literal::Bool(true)),
        Literal::Bool(_) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected numeric operand",
        }),
    })
}

pub(crate) fn eval_not(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Not;
    check_arity(primitive, inputs, 1)?;
    map_elements(&inputs[0], inputs[0].dtype(), |lit| match lit {
        Literal::Bool(b) => Ok(Literal::Bool(!b)),
        Literal::I64(v) => Ok(Literal::I64(!v)),
        Literal::F64Bits(_) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "not requires bool or integer operand",
        }),
    })
}

/// Params: `new_dtype` (`bool`, `i64` or `f64`).
pub(crate) fn eval_convert_element_type(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::ConvertElementType;
    check_arity(primitive, inputs, 1)?;
    let raw = params
        .get("new_dtype")
        .ok_or_else(|| EvalError::Unsupported {
            primitive,
            detail: "missing required param 'new_dtype'".to_owned(),
        })?;
    let dtype = DType::parse(raw).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("unknown dtype '{raw}'"),
    })?;
    map_elements(&inputs[0], dtype, |lit| Ok(lit.cast(dtype)))
}

/// Binary arithmetic with broadcasting; booleans widen to i64.
pub(crate) fn eval_binary_arith(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 2)?;
    let dtype = arithmetic_dtype(result_dtype(inputs));
    eval_broadcasting(primitive, inputs, dtype, |args| {
        binary_literal_op(args[0], args[1], dtype, primitive, &int_op, &float_op)
    })
}

/// `max`/`min`; bool operands stay bool (max is `or`, min is `and`).
pub(crate) fn eval_extremum(
    primitive: Primitive,
    inputs: &[Value],
    pick_max: bool,
) -> Result<Value, EvalError> {
    if !inputs.is_empty() && inputs.iter().all(|input| input.dtype() == DType::Bool) {
        return if pick_max {
            eval_logical(primitive, inputs, |a, b| a | b, i64::max)
        } else {
            eval_logical(primitive, inputs, |a, b| a & b, i64::min)
        };
    }
    if pick_max {
        eval_binary_arith(primitive, inputs, |a, b| Some(a.max(b)), f64::max)
    } else {
        eval_binary_arith(primitive, inputs, |a, b| Some(a.min(b)), f64::min)
    }
}

pub(crate) fn eval_atan2(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Atan2;
    check_arity(primitive, inputs, 2)?;
    eval_broadcasting(primitive, inputs, DType::F64, |args| {
        binary_literal_op(
            args[0],
            args[1],
            DType::F64,
            primitive,
            &|_, _| None,
            &f64::atan2,
        )
    })
}

/// And/or/xor: logical on bools, bitwise on integers.
pub(crate) fn eval_logical(
    primitive: Primitive,
    inputs: &[Value],
    bool_op: impl Fn(bool, bool) -> bool,
    int_op: impl Fn(i64, i64) -> i64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 2)?;
    let dtype = result_dtype(inputs);
    if dtype == DType::F64 {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "logical ops require bool or integer operands",
        });
    }
    eval_broadcasting(primitive, inputs, dtype, |args| {
        match (args[0].cast(dtype), args[1].cast(dtype)) {
            (Literal::Bool(a), Literal::Bool(b)) => Ok(Literal::Bool(bool_op(a, b))),
            (Literal::I64(a), Literal::I64(b)) => Ok(Literal::I64(int_op(a, b))),
            _ => Err(EvalError::TypeMismatch {
                primitive,
                detail: "logical ops require bool or integer operands",
            }),
        }
    })
}

pub(crate) fn eval_shift(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(i64, u32) -> i64,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 2)?;
    if inputs.iter().any(|input| input.dtype() == DType::F64) {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "shift requires integer operands",
        });
    }
    eval_broadcasting(primitive, inputs, DType::I64, |args| {
        let value = args[0].cast(DType::I64).as_i64().unwrap_or(0);
        let amount = args[1].cast(DType::I64).as_i64().unwrap_or(0);
        let amount = u32::try_from(amount.clamp(0, 64)).unwrap_or(64);
        Ok(Literal::I64(op(value, amount)))
    })
}

/// Inputs: `[pred, on_true, on_false]`; `pred` must be boolean.
pub(crate) fn eval_select(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Select;
    check_arity(primitive, inputs, 3)?;
    if inputs[0].dtype() != DType::Bool {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: "select predicate must be bool",
        });
    }
    let dtype = result_dtype(&inputs[1..]);
    eval_broadcasting(primitive, inputs, dtype, |args| match args[0] {
        Literal::Bool(true) => Ok(args[1]),
        _ => Ok(args[2]),
    })
}

/// Inputs: `[lo, x, hi]`.
pub(crate) fn eval_clamp(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Clamp;
    check_arity(primitive, inputs, 3)?;
    let dtype = arithmetic_dtype(result_dtype(inputs));
    eval_broadcasting(primitive, inputs, dtype, |args| {
        let upper = binary_literal_op(
            args[1],
            args[2],
            dtype,
            primitive,
            &|a, b| Some(a.min(b)),
            &f64::min,
        )?;
        binary_literal_op(
            args[0],
            upper,
            dtype,
            primitive,
            &|a, b| Some(a.max(b)),
            &f64::max,
        )
    })
}

fn parse_optional_dims(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    if params.contains_key(key) {
        parse_usize_param(primitive, key, params)
    } else {
        Ok(Vec::new())
    }
}

/// Generalized contraction. Params: `lhs_contracting_dimensions`,
/// `rhs_contracting_dimensions`, and optional `lhs_batch_dimensions`,
/// `rhs_batch_dimensions`. Output dims: batch, lhs free, rhs free.
pub(crate) fn eval_dot_general(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::DotGeneral;
    check_arity(primitive, inputs, 2)?;
    let lhs_contract = parse_usize_param(primitive, "lhs_contracting_dimensions", params)?;
    let rhs_contract = parse_usize_param(primitive, "rhs_contracting_dimensions", params)?;
    let lhs_batch = parse_optional_dims(primitive, "lhs_batch_dimensions", params)?;
    let rhs_batch = parse_optional_dims(primitive, "rhs_batch_dimensions", params)?;

    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let (lhs_shape, rhs_shape) = (lhs.shape(), rhs.shape());

    if lhs_contract.len() != rhs_contract.len() || lhs_batch.len() != rhs_batch.len() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: "lhs and rhs dimension lists differ in length".to_owned(),
        });
    }
    for (&l, &r) in lhs_contract
        .iter()
        .zip(&rhs_contract)
        .chain(lhs_batch.iter().zip(&rhs_batch))
    {
        if l >= lhs_shape.rank() || r >= rhs_shape.rank() {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("dimension pair ({l}, {r}) out of range"),
            });
        }
        if lhs_shape.dims[l] != rhs_shape.dims[r] {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: lhs_shape.clone(),
                right: rhs_shape.clone(),
            });
        }
    }

    let lhs_free = (0..lhs_shape.rank())
        .filter(|axis| !lhs_contract.contains(axis) && !lhs_batch.contains(axis))
        .collect::<Vec<_>>();
    let rhs_free = (0..rhs_shape.rank())
        .filter(|axis| !rhs_contract.contains(axis) && !rhs_batch.contains(axis))
        .collect::<Vec<_>>();
    if lhs_free.len() + lhs_contract.len() + lhs_batch.len() != lhs_shape.rank()
        || rhs_free.len() + rhs_contract.len() + rhs_batch.len() != rhs_shape.rank()
    {
        return Err(EvalError::Unsupported {
            primitive,
            detail: "repeated dimension in dimension lists".to_owned(),
        });
    }

    let out_dims = lhs_batch
        .iter()
        .map(|&axis| lhs_shape.dims[axis])
        .chain(lhs_free.iter().map(|&axis| lhs_shape.dims[axis]))
        .chain(rhs_free.iter().map(|&axis| rhs_shape.dims[axis]))
        .collect::<Vec<_>>();
    let contract_dims = lhs_contract
        .iter()
        .map(|&axis| lhs_shape.dims[axis])
        .collect::<Vec<_>>();
    let out_shape = Shape::new(out_dims);
    let out_count = out_shape
        .element_count()
        .ok_or_else(|| ValueError::ShapeOverflow {
            shape: out_shape.clone(),
        })? as usize;
    let contract_count = contract_dims.iter().map(|&d| d as usize).product::<usize>();

    let dtype = arithmetic_dtype(result_dtype(inputs));
    let zero = Literal::I64(0).cast(dtype);
    let lhs_strides = row_major_strides(&lhs_shape.dims);
    let rhs_strides = row_major_strides(&rhs_shape.dims);
    let (n_batch, n_lhs_free) = (lhs_batch.len(), lhs_free.len());

    let mut elements = Vec::with_capacity(out_count);
    let mut lhs_idx = vec![0_usize; lhs_shape.rank()];
    let mut rhs_idx = vec![0_usize; rhs_shape.rank()];
    for flat in 0..out_count {
        let out_multi = unravel_index(flat, &out_shape.dims);
        for (k, (&l, &r)) in lhs_batch.iter().zip(&rhs_batch).enumerate() {
            lhs_idx[l] = out_multi[k];
            rhs_idx[r] = out_multi[k];
        }
        for (k, &axis) in lhs_free.iter().enumerate() {
            lhs_idx[axis] = out_multi[n_batch + k];
        }
        for (k, &axis) in rhs_free.iter().enumerate() {
            rhs_idx[axis] = out_multi[n_batch + n_lhs_free + k];
        }

        let mut acc = zero;
        for c in 0..contract_count {
            let c_multi = unravel_index(c, &contract_dims);
            for (k, (&l, &r)) in lhs_contract.iter().zip(&rhs_contract).enumerate() {
                lhs_idx[l] = c_multi[k];
                rhs_idx[r] = c_multi[k];
            }
            let l_off = lhs_idx.iter().zip(&lhs_strides).map(|(i, s)| i * s).sum::<usize>();
            let r_off = rhs_idx.iter().zip(&rhs_strides).map(|(i, s)| i * s).sum::<usize>();
            acc = multiply_accumulate(acc, lhs.elements()[l_off], rhs.elements()[r_off], dtype);
        }
        elements.push(acc);
    }

    Ok(Value::from_parts(dtype, out_shape, elements)?)
}

#[cfg(test)]
mod tests {
    use super::broadcast_shape;
    use tv_core::{Primitive, Value};

    #[test]
    fn broadcast_shape_right_aligns_ranks() {
        let a = Value::tensor_f64(&[2, 1, 3], &[0.0; 6]).expect("a");
        let b = Value::tensor_f64(&[4, 1], &[0.0; 4]).expect("b");
        let shape = broadcast_shape(Primitive::Add, &[a, b]).expect("broadcast");
        assert_eq!(shape.dims, vec![2, 4, 3]);
    }

    #[test]
    fn broadcast_shape_of_scalars_is_scalar() {
        let shape = broadcast_shape(
            Primitive::Mul,
            &[Value::scalar_f64(1.0), Value::scalar_i64(2)],
        )
        .expect("broadcast");
        assert_eq!(shape.rank(), 0);
    }

    #[test]
    fn zero_extent_broadcasts_against_one() {
        let a = Value::tensor_f64(&[0, 2], &[]).expect("a");
        let b = Value::tensor_f64(&[1, 2], &[1.0, 2.0]).expect("b");
        let shape = broadcast_shape(Primitive::Add, &[a, b]).expect("broadcast");
        assert_eq!(shape.dims, vec![0, 2]);
    }
}

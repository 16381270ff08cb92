#![forbid(unsafe_code)]

use tv_core::{DType, Literal, Primitive, Value};

use crate::arithmetic::eval_broadcasting;
use crate::type_promotion::{compare_literals, result_dtype};
use crate::{EvalError, check_arity};

/// Broadcasting comparison producing a bool result.
pub(crate) fn eval_comparison(
    primitive: Primitive,
    inputs: &[Value],
    int_cmp: impl Fn(i64, i64) -> bool,
    float_cmp: impl Fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    check_arity(primitive, inputs, 2)?;
    let dtype = result_dtype(inputs);
    eval_broadcasting(primitive, inputs, DType::Bool, |args| {
        compare_literals(args[0], args[1], dtype, primitive, &int_cmp, &float_cmp)
            .map(Literal::Bool)
    })
}

#[cfg(test)]
mod tests {
    use super::eval_comparison;
    use tv_core::{DType, Literal, Primitive, Value};

    #[test]
    fn compares_mixed_int_and_float() {
        let out = eval_comparison(
            Primitive::Ge,
            &[Value::scalar_i64(2), Value::scalar_f64(1.5)],
            |a, b| a >= b,
            |a, b| a >= b,
        )
        .expect("ge");
        assert_eq!(out, Value::scalar_bool(true));
    }

    #[test]
    fn nan_is_never_equal() {
        let out = eval_comparison(
            Primitive::Eq,
            &[Value::scalar_f64(f64::NAN), Value::scalar_f64(f64::NAN)],
            |a, b| a == b,
            |a, b| a == b,
        )
        .expect("eq");
        assert_eq!(out.dtype(), DType::Bool);
        assert_eq!(out.elements(), &[Literal::Bool(false)]);
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::{Literal, Primitive, Shape, Value, ValueError};

use crate::type_promotion::result_dtype;
use crate::{EvalError, check_arity, parse_usize_list};

/// Parse a required comma-separated list of usize values from a param string.
pub(crate) fn parse_usize_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    let raw = params.get(key).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("missing required param '{key}'"),
    })?;
    parse_usize_list(raw).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("invalid usize list in param '{key}': '{raw}'"),
    })
}

fn parse_dims_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<u32>, EvalError> {
    parse_usize_param(primitive, key, params)?
        .into_iter()
        .map(|dim| {
            u32::try_from(dim).map_err(|_| EvalError::Unsupported {
                primitive,
                detail: format!("dimension {dim} in param '{key}' is too large"),
            })
        })
        .collect()
}

/// Row-major strides, in elements, for `dims`.
#[must_use]
pub fn row_major_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1] as usize;
    }
    strides
}

/// Inverse of row-major flattening.
#[must_use]
pub fn unravel_index(mut flat: usize, dims: &[u32]) -> Vec<usize> {
    let mut multi = vec![0_usize; dims.len()];
    for axis in (0..dims.len()).rev() {
        let extent = dims[axis] as usize;
        if extent > 0 {
            multi[axis] = flat % extent;
            flat /= extent;
        }
    }
    multi
}

/// Builds an output of `out_dims` whose element at each multi-index is read
/// from the input's flat offset returned by `source`.
fn gather_from(
    input: &Value,
    out_dims: Vec<u32>,
    source: impl Fn(&[usize]) -> usize,
) -> Result<Value, EvalError> {
    let out_shape = Shape::new(out_dims);
    let count = out_shape
        .element_count()
        .ok_or_else(|| ValueError::ShapeOverflow {
            shape: out_shape.clone(),
        })? as usize;
    let elements = (0..count)
        .map(|flat| input.elements()[source(&unravel_index(flat, &out_shape.dims))])
        .collect::<Vec<Literal>>();
    Ok(Value::from_parts(input.dtype(), out_shape, elements)?)
}

fn with_shape(
    primitive: Primitive,
    input: &Value,
    out_dims: Vec<u32>,
) -> Result<Value, EvalError> {
    let out_shape = Shape::new(out_dims);
    if out_shape.element_count() != input.shape().element_count() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: input.shape(),
            right: out_shape,
        });
    }
    Ok(Value::from_parts(
        input.dtype(),
        out_shape,
        input.elements().to_vec(),
    )?)
}

/// Params: `permutation`.
pub(crate) fn eval_transpose(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Transpose;
    check_arity(primitive, inputs, 1)?;
    let input = &inputs[0];
    let shape = input.shape();
    let perm = parse_usize_param(primitive, "permutation", params)?;

    let mut seen = vec![false; shape.rank()];
    let valid = perm.len() == shape.rank()
        && perm
            .iter()
            .all(|&axis| axis < seen.len() && !std::mem::replace(&mut seen[axis], true));
    if !valid {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "permutation {perm:?} is not a permutation of rank {}",
                shape.rank()
            ),
        });
    }

    let strides = row_major_strides(&shape.dims);
    let out_dims = perm.iter().map(|&axis| shape.dims[axis]).collect();
    gather_from(input, out_dims, |out| {
        out.iter()
            .zip(&perm)
            .map(|(idx, &axis)| idx * strides[axis])
            .sum()
    })
}

/// Params: `shape`, `broadcast_dimensions` (operand axis k lands on output
/// axis `broadcast_dimensions[k]`).
pub(crate) fn eval_broadcast_in_dim(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::BroadcastInDim;
    check_arity(primitive, inputs, 1)?;
    let input = &inputs[0];
    let shape = input.shape();
    let out_dims = parse_dims_param(primitive, "shape", params)?;
    let mapping = parse_usize_param(primitive, "broadcast_dimensions", params)?;

    if mapping.len() != shape.rank() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "broadcast_dimensions has {} entries for operand rank {}",
                mapping.len(),
                shape.rank()
            ),
        });
    }
    for (axis, &target) in mapping.iter().enumerate() {
        let fits = target < out_dims.len()
            && (shape.dims[axis] == 1 || shape.dims[axis] == out_dims[target]);
        if !fits {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: shape.clone(),
                right: Shape::new(out_dims.clone()),
            });
        }
    }

    let strides = row_major_strides(&shape.dims);
    gather_from(input, out_dims, |out| {
        mapping
            .iter()
            .enumerate()
            .map(|(axis, &target)| {
                if shape.dims[axis] == 1 {
                    0
                } else {
                    out[target] * strides[axis]
                }
            })
            .sum()
    })
}

/// Params: `dimension`.
pub(crate) fn eval_concatenate(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Concatenate;
    if inputs.is_empty() {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    }
    let dimension = match parse_usize_param(primitive, "dimension", params)?.as_slice() {
        [dimension] => *dimension,
        other => {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!("expected a single dimension, got {other:?}"),
            });
        }
    };

    let first = inputs[0].shape();
    if dimension >= first.rank() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("dimension {dimension} out of range for rank {}", first.rank()),
        });
    }
    let mut out_dims = first.dims.clone();
    out_dims[dimension] = 0;
    for input in inputs {
        let shape = input.shape();
        let compatible = shape.rank() == first.rank()
            && shape
                .dims
                .iter()
                .zip(&first.dims)
                .enumerate()
                .all(|(axis, (a, b))| axis == dimension || a == b);
        if !compatible {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: first.clone(),
                right: shape,
            });
        }
        out_dims[dimension] += shape.dims[dimension];
    }

    let dtype = result_dtype(inputs);
    let out_shape = Shape::new(out_dims);
    let outer = first.dims[..dimension]
        .iter()
        .map(|&d| d as usize)
        .product::<usize>();
    let mut elements = Vec::new();
    for block in 0..outer {
        for input in inputs {
            let shape = input.shape();
            let chunk = shape.dims[dimension..]
                .iter()
                .map(|&d| d as usize)
                .product::<usize>();
            elements.extend(
                input.elements()[block * chunk..(block + 1) * chunk]
                    .iter()
                    .map(|lit| lit.cast(dtype)),
            );
        }
    }
    Ok(Value::from_parts(dtype, out_shape, elements)?)
}

/// Params: `dimensions` (each must have extent 1).
pub(crate) fn eval_squeeze(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Squeeze;
    check_arity(primitive, inputs, 1)?;
    let shape = inputs[0].shape();
    let dims = parse_usize_param(primitive, "dimensions", params)?;
    if let Some(&bad) = dims
        .iter()
        .find(|&&axis| axis >= shape.rank() || shape.dims[axis] != 1)
    {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("cannot squeeze dimension {bad} of shape {shape}"),
        });
    }
    let out_dims = shape
        .dims
        .iter()
        .enumerate()
        .filter(|(axis, _)| !dims.contains(axis))
        .map(|(_, &dim)| dim)
        .collect();
    with_shape(primitive, &inputs[0], out_dims)
}

/// Params: `dimensions`, positions of the new unit axes in the output.
pub(crate) fn eval_expand_dims(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::ExpandDims;
    check_arity(primitive, inputs, 1)?;
    let shape = inputs[0].shape();
    let dims = parse_usize_param(primitive, "dimensions", params)?;
    let out_rank = shape.rank() + dims.len();
    if let Some(&bad) = dims.iter().find(|&&axis| axis >= out_rank) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("expand dimension {bad} out of range for rank {out_rank}"),
        });
    }
    let mut source = shape.dims.iter().copied();
    let out_dims = (0..out_rank)
        .map(|axis| {
            if dims.contains(&axis) {
                1
            } else {
                source.next().unwrap_or(1)
            }
        })
        .collect();
    with_shape(primitive, &inputs[0], out_dims)
}

/// Params: `new_shape`.
pub(crate) fn eval_reshape(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Reshape;
    check_arity(primitive, inputs, 1)?;
    let out_dims = parse_dims_param(primitive, "new_shape", params)?;
    with_shape(primitive, &inputs[0], out_dims)
}

/// Params: `start_indices`, `limit_indices` (unit strides).
pub(crate) fn eval_slice(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Slice;
    check_arity(primitive, inputs, 1)?;
    let input = &inputs[0];
    let shape = input.shape();
    let start = parse_usize_param(primitive, "start_indices", params)?;
    let limit = parse_usize_param(primitive, "limit_indices", params)?;

    if start.len() != shape.rank() || limit.len() != shape.rank() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("slice bounds must have rank {}", shape.rank()),
        });
    }
    let mut out_dims = Vec::with_capacity(shape.rank());
    for axis in 0..shape.rank() {
        if start[axis] > limit[axis] || limit[axis] > shape.dims[axis] as usize {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!(
                    "slice [{}, {}) out of bounds for dimension {axis} of shape {shape}",
                    start[axis], limit[axis]
                ),
            });
        }
        out_dims.push((limit[axis] - start[axis]) as u32);
    }

    let strides = row_major_strides(&shape.dims);
    gather_from(input, out_dims, |out| {
        out.iter()
            .zip(&start)
            .zip(&strides)
            .map(|((idx, offset), stride)| (idx + offset) * stride)
            .sum()
    })
}

#[cfg(test)]
mod tests {
    use super::{row_major_strides, unravel_index};

    #[test]
    fn strides_are_row_major() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn unravel_round_trips_through_strides() {
        let dims = [2, 3, 4];
        let strides = row_major_strides(&dims);
        for flat in 0..24 {
            let multi = unravel_index(flat, &dims);
            let back = multi.iter().zip(&strides).map(|(i, s)| i * s).sum::<usize>();
            assert_eq!(back, flat);
        }
    }
}

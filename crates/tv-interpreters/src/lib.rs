#![forbid(unsafe_code)]

//! Equation-list evaluation, plain and tree-vectorized.

use log::debug;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tv_core::{Atom, Jaxpr, JaxprValidationError, Primitive, Value, VarId};
use tv_engine::{
    Dispatcher, EngineConfig, StructuredValue, TreeError, convert, convert_leaf, restore,
};
use tv_lax::{EvalError, eval_primitive};
use tv_tree::{ContainerCodec, ContainerShape, PyTreeCodec, Tree};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    MissingVariable(VarId),
    UnexpectedOutputArity {
        primitive: Primitive,
        actual: usize,
    },
    InvalidProgram(JaxprValidationError),
    Primitive(EvalError),
    Tree(TreeError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(f, "input arity mismatch: expected {expected}, got {actual}")
            }
            Self::MissingVariable(var) => write!(f, "missing variable v{}", var.0),
            Self::UnexpectedOutputArity { primitive, actual } => write!(
                f,
                "expected single-output primitive {}, got {actual} outputs",
                primitive.as_str()
            ),
            Self::InvalidProgram(err) => write!(f, "invalid program: {err}"),
            Self::Primitive(err) => write!(f, "primitive eval failed: {err}"),
            Self::Tree(err) => write!(f, "tree eval failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidProgram(err) => Some(err),
            Self::Primitive(err) => Some(err),
            Self::Tree(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EvalError> for InterpreterError {
    fn from(value: EvalError) -> Self {
        Self::Primitive(value)
    }
}

impl From<TreeError> for InterpreterError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

impl From<JaxprValidationError> for InterpreterError {
    fn from(value: JaxprValidationError) -> Self {
        Self::InvalidProgram(value)
    }
}

fn check_input_arity(jaxpr: &Jaxpr, actual: usize) -> Result<(), InterpreterError> {
    if actual != jaxpr.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.invars.len(),
            actual,
        });
    }
    Ok(())
}

fn single_output(eqn: &tv_core::Equation) -> Result<VarId, InterpreterError> {
    match eqn.outputs.as_slice() {
        [out] => Ok(*out),
        other => Err(InterpreterError::UnexpectedOutputArity {
            primitive: eqn.primitive,
            actual: other.len(),
        }),
    }
}

/// Evaluates `jaxpr` on plain arrays with the kernels directly.
pub fn eval_jaxpr(jaxpr: &Jaxpr, args: &[Value]) -> Result<Vec<Value>, InterpreterError> {
    check_input_arity(jaxpr, args.len())?;

    let mut env: BTreeMap<VarId, Value> = BTreeMap::new();
    for (var, arg) in jaxpr.invars.iter().zip(args) {
        env.insert(*var, arg.clone());
    }

    for eqn in &jaxpr.equations {
        let out = single_output(eqn)?;
        let mut resolved = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => resolved.push(
                    env.get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?,
                ),
                Atom::Lit(lit) => resolved.push(Value::Scalar(*lit)),
            }
        }
        let output = eval_primitive(eqn.primitive, &resolved, &eqn.params)?;
        env.insert(out, output);
    }

    jaxpr
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}

/// Evaluates `jaxpr` on structured values, dispatching every equation
/// through the rewrite rules. Literal inputs are lifted with
/// [`convert_leaf`].
pub fn eval_jaxpr_structured<D: ContainerShape>(
    jaxpr: &Jaxpr,
    args: &[StructuredValue<D>],
    config: &EngineConfig,
) -> Result<Vec<StructuredValue<D>>, InterpreterError> {
    check_input_arity(jaxpr, args.len())?;
    let dispatcher = Dispatcher::new(*config);

    let mut env: FxHashMap<VarId, StructuredValue<D>> = FxHashMap::default();
    for (var, arg) in jaxpr.invars.iter().zip(args) {
        env.insert(*var, arg.clone());
    }

    for eqn in &jaxpr.equations {
        let out = single_output(eqn)?;
        let mut resolved = Vec::with_capacity(eqn.inputs.len());
        for atom in &eqn.inputs {
            match atom {
                Atom::Var(var) => resolved.push(
                    env.get(var)
                        .cloned()
                        .ok_or(InterpreterError::MissingVariable(*var))?,
                ),
                Atom::Lit(lit) => resolved.push(convert_leaf(Value::Scalar(*lit))?),
            }
        }
        let output = dispatcher.dispatch(eqn.primitive, &resolved, &eqn.params)?;
        env.insert(out, output);
    }

    jaxpr
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or(InterpreterError::MissingVariable(*var))
        })
        .collect()
}

/// Runs `jaxpr` over containers: each argument is converted to a rank-1
/// structured value, the program is evaluated structurally and each output
/// is restored to a container.
pub fn tree_vectorize_with<C: ContainerCodec>(
    codec: &C,
    jaxpr: &Jaxpr,
    containers: &[C::Container],
    config: &EngineConfig,
) -> Result<Vec<C::Container>, InterpreterError> {
    jaxpr.validate_well_formed()?;
    check_input_arity(jaxpr, containers.len())?;
    let args = containers
        .iter()
        .map(|container| convert(codec, container, config))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(
        "tree_vectorize: {} argument(s), {} equation(s)",
        args.len(),
        jaxpr.equations.len()
    );
    let outputs = eval_jaxpr_structured(jaxpr, &args, config)?;
    outputs
        .iter()
        .map(|output| restore(codec, output).map_err(InterpreterError::from))
        .collect()
}

/// [`tree_vectorize_with`] over [`Tree`] containers.
pub fn tree_vectorize(
    jaxpr: &Jaxpr,
    trees: &[Tree],
    config: &EngineConfig,
) -> Result<Vec<Tree>, InterpreterError> {
    tree_vectorize_with(&PyTreeCodec, jaxpr, trees, config)
}

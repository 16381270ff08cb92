#![forbid(unsafe_code)]

//! Tree-vectorized tensors: logical arrays whose axes are partitioned into
//! irregular leaves described by a container, plus the rewrite rules that
//! evaluate array primitives on them block by block.

pub mod block_store;
pub mod config;
pub mod convert;
pub mod coords;
pub mod error;
pub mod registry;
mod rules;
pub mod structure;

pub use block_store::BlockStore;
pub use config::{EngineConfig, LOWER_TRIVIAL_KEY, PROMOTE_LEAVES_KEY};
pub use convert::{convert, convert_leaf, convert_leaf_container, restore};
pub use coords::{
    Coords, CoordinateIter, block_shape, iterate_coordinates, physical_subaxis_range,
    segments_length, split_along_axis,
};
pub use error::TreeError;
pub use registry::{RULE_TABLE, RuleKind, lookup_rule};
pub use structure::{AxisStructure, StructuredValue};

use log::{debug, trace};
use std::collections::BTreeMap;
use tv_core::{Primitive, Value};
use tv_lax::eval_primitive;
use tv_tree::ContainerShape;

/// Runs the plain-array kernel for one block.
pub(crate) fn run_kernel(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, TreeError> {
    eval_primitive(primitive, inputs, params).map_err(TreeError::from)
}

// ── Dispatch ───────────────────────────────────────────────────────

/// Routes primitives on structured operands to their rewrite rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatcher {
    config: EngineConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluates `primitive` on structured operands.
    ///
    /// When trivial lowering is enabled and every operand is a single plain
    /// array, the kernel runs once on the lowered arrays and the result is
    /// lifted back with [`convert_leaf`]. Otherwise the registered rule
    /// produces the result layout and blocks, which are re-validated.
    pub fn dispatch<D: ContainerShape>(
        &self,
        primitive: Primitive,
        operands: &[StructuredValue<D>],
        params: &BTreeMap<String, String>,
    ) -> Result<StructuredValue<D>, TreeError> {
        let kind = lookup_rule(primitive).ok_or(TreeError::UnsupportedPrimitive(primitive))?;

        if self.config.lower_trivial && !operands.is_empty() {
            let lowered = operands
                .iter()
                .map(StructuredValue::lower)
                .collect::<Option<Vec<_>>>();
            if let Some(lowered) = lowered {
                trace!("{primitive}: all operands trivial, evaluating directly");
                let inputs = lowered.into_iter().cloned().collect::<Vec<_>>();
                return convert_leaf(run_kernel(primitive, &inputs, params)?);
            }
        }

        let (axes, blocks) = rules::apply_rule(kind, primitive, operands, params)?;
        let result = StructuredValue::new(axes, blocks)?;
        debug!(
            "{primitive}: operand ranks {:?} -> shape {} in {} block(s)",
            operands.iter().map(StructuredValue::rank).collect::<Vec<_>>(),
            result.shape(),
            result.blocks().len()
        );
        Ok(result)
    }
}

/// [`Dispatcher::dispatch`] with the default configuration.
pub fn dispatch<D: ContainerShape>(
    primitive: Primitive,
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<StructuredValue<D>, TreeError> {
    Dispatcher::default().dispatch(primitive, operands, params)
}

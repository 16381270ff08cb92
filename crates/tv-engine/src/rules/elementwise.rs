#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use tv_core::Primitive;
use tv_tree::ContainerShape;

use super::{RuleOutput, expect_arity};
use crate::block_store::BlockStore;
use crate::structure::StructuredValue;
use crate::{TreeError, run_kernel};

/// Layout passes through unchanged; the kernel maps every block.
pub(crate) fn elementwise_rule<D: ContainerShape>(
    primitive: Primitive,
    operands: &[StructuredValue<D>],
    params: &BTreeMap<String, String>,
) -> Result<RuleOutput<D>, TreeError> {
    expect_arity(primitive, operands, 1)?;
    let operand = &operands[0];
    let mut blocks = BlockStore::new(operand.blocks().extents());
    for (coords, block) in operand.blocks().iter() {
        let mapped = run_kernel(primitive, std::slice::from_ref(block), params)?;
        blocks.insert(&coords, mapped)?;
    }
    Ok((operand.axes().to_vec(), blocks))
}

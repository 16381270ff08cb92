#![forbid(unsafe_code)]

use rustc_hash::FxHashMap;
use std::sync::LazyLock;
use tv_core::Primitive;

/// Which structural rule handles a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// One operand; layout passes through and each block is mapped.
    Elementwise,
    /// Broadcasting n-ary op with per-axis layout reconciliation.
    Nary,
    Concatenate,
    BroadcastInDim,
    ExpandDims,
    Squeeze,
    Transpose,
    /// Per-block reduction folded across partitions with `combiner`.
    Reduce { combiner: Primitive },
    DotGeneral,
}

pub const RULE_TABLE: &[(Primitive, RuleKind)] = &[
    // Unary
    (Primitive::Copy, RuleKind::Elementwise),
    (Primitive::Neg, RuleKind::Elementwise),
    (Primitive::Abs, RuleKind::Elementwise),
    (Primitive::Sign, RuleKind::Elementwise),
    (Primitive::Floor, RuleKind::Elementwise),
    (Primitive::Ceil, RuleKind::Elementwise),
    (Primitive::Round, RuleKind::Elementwise),
    (Primitive::Exp, RuleKind::Elementwise),
    (Primitive::Log, RuleKind::Elementwise),
    (Primitive::Expm1, RuleKind::Elementwise),
    (Primitive::Log1p, RuleKind::Elementwise),
    (Primitive::Sqrt, RuleKind::Elementwise),
    (Primitive::Rsqrt, RuleKind::Elementwise),
    (Primitive::Square, RuleKind::Elementwise),
    (Primitive::Reciprocal, RuleKind::Elementwise),
    (Primitive::Logistic, RuleKind::Elementwise),
    (Primitive::Sin, RuleKind::Elementwise),
    (Primitive::Cos, RuleKind::Elementwise),
    (Primitive::Tan, RuleKind::Elementwise),
    (Primitive::Sinh, RuleKind::Elementwise),
    (Primitive::Cosh, RuleKind::Elementwise),
    (Primitive::Tanh, RuleKind::Elementwise),
    (Primitive::IsFinite, RuleKind::Elementwise),
    (Primitive::Not, RuleKind::Elementwise),
    (Primitive::ConvertElementType, RuleKind::Elementwise),
    // N-ary
    (Primitive::Add, RuleKind::Nary),
    (Primitive::Sub, RuleKind::Nary),
    (Primitive::Mul, RuleKind::Nary),
    (Primitive::Div, RuleKind::Nary),
    (Primitive::Rem, RuleKind::Nary),
    (Primitive::Pow, RuleKind::Nary),
    (Primitive::Max, RuleKind::Nary),
    (Primitive::Min, RuleKind::Nary),
    (Primitive::Atan2, RuleKind::Nary),
    (Primitive::Eq, RuleKind::Nary),
    (Primitive::Ne, RuleKind::Nary),
    (Primitive::Lt, RuleKind::Nary),
    (Primitive::Le, RuleKind::Nary),
    (Primitive::Gt, RuleKind::Nary),
    (Primitive::Ge, RuleKind::Nary),
    (Primitive::And, RuleKind::Nary),
    (Primitive::Or, RuleKind::Nary),
    (Primitive::Xor, RuleKind::Nary),
    (Primitive::ShiftLeft, RuleKind::Nary),
    (Primitive::ShiftRight, RuleKind::Nary),
    (Primitive::Select, RuleKind::Nary),
    (Primitive::Clamp, RuleKind::Nary),
    // Structural
    (Primitive::Concatenate, RuleKind::Concatenate),
    (Primitive::BroadcastInDim, RuleKind::BroadcastInDim),
    (Primitive::ExpandDims, RuleKind::ExpandDims),
    (Primitive::Squeeze, RuleKind::Squeeze),
    (Primitive::Transpose, RuleKind::Transpose),
    // Reductions
    (
        Primitive::ReduceSum,
        RuleKind::Reduce {
            combiner: Primitive::Add,
        },
    ),
    (
        Primitive::ReduceProd,
        RuleKind::Reduce {
            combiner: Primitive::Mul,
        },
    ),
    (
        Primitive::ReduceMax,
        RuleKind::Reduce {
            combiner: Primitive::Max,
        },
    ),
    (
        Primitive::ReduceMin,
        RuleKind::Reduce {
            combiner: Primitive::Min,
        },
    ),
    (
        Primitive::ReduceOr,
        RuleKind::Reduce {
            combiner: Primitive::Or,
        },
    ),
    (
        Primitive::ReduceAnd,
        RuleKind::Reduce {
            combiner: Primitive::And,
        },
    ),
    // Contraction
    (Primitive::DotGeneral, RuleKind::DotGeneral),
];

static RULE_INDEX: LazyLock<FxHashMap<Primitive, RuleKind>> =
    LazyLock::new(|| RULE_TABLE.iter().copied().collect());

#[must_use]
pub fn lookup_rule(primitive: Primitive) -> Option<RuleKind> {
    RULE_INDEX.get(&primitive).copied()
}

#[cfg(test)]
mod tests {
    use super::{RULE_TABLE, RuleKind, lookup_rule};
    use std::collections::BTreeSet;
    use tv_core::Primitive;

    #[test]
    fn table_has_no_duplicate_primitives() {
        let unique = RULE_TABLE
            .iter()
            .map(|(primitive, _)| *primitive)
            .collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), RULE_TABLE.len());
    }

    #[test]
    fn reducers_map_to_their_combiners() {
        assert_eq!(
            lookup_rule(Primitive::ReduceSum),
            Some(RuleKind::Reduce {
                combiner: Primitive::Add
            })
        );
        assert_eq!(
            lookup_rule(Primitive::ReduceAnd),
            Some(RuleKind::Reduce {
                combiner: Primitive::And
            })
        );
    }

    #[test]
    fn reshape_and_slice_have_no_rule() {
        assert_eq!(lookup_rule(Primitive::Reshape), None);
        assert_eq!(lookup_rule(Primitive::Slice), None);
        assert_eq!(lookup_rule(Primitive::Add), Some(RuleKind::Nary));
    }
}

#![forbid(unsafe_code)]

//! Nested containers of array leaves and their flatten/unflatten codec.
//!
//! The engine never inspects containers directly. It sees them through
//! [`ContainerCodec`], which turns a container into an ordered leaf list and
//! a hashable [`ContainerShape`] descriptor, and back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use tv_core::Value;

/// A nested container whose leaves are array values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tree {
    Leaf(Value),
    None,
    Tuple(Vec<Tree>),
    List(Vec<Tree>),
    Dict(BTreeMap<String, Tree>),
}

impl Tree {
    #[must_use]
    pub fn leaf(value: Value) -> Self {
        Self::Leaf(value)
    }

    #[must_use]
    pub fn dict<K: Into<String>>(entries: impl IntoIterator<Item = (K, Tree)>) -> Self {
        Self::Dict(
            entries
                .into_iter()
                .map(|(key, tree)| (key.into(), tree))
                .collect(),
        )
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Self::Leaf(value) => Some(value),
            _ => None,
        }
    }
}

/// Structure of a [`Tree`] with the leaves removed. Dict entries are kept
/// in key order, which is also the leaf order produced by [`flatten`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeDef {
    Leaf,
    None,
    Tuple(Vec<TreeDef>),
    List(Vec<TreeDef>),
    Dict(BTreeMap<String, TreeDef>),
}

impl TreeDef {
    #[must_use]
    pub fn leaf() -> Self {
        Self::Leaf
    }

    #[must_use]
    pub fn num_leaves(&self) -> usize {
        match self {
            Self::Leaf => 1,
            Self::None => 0,
            Self::Tuple(children) | Self::List(children) => {
                children.iter().map(Self::num_leaves).sum()
            }
            Self::Dict(entries) => entries.values().map(Self::num_leaves).sum(),
        }
    }
}

impl std::fmt::Display for TreeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join(f: &mut std::fmt::Formatter<'_>, items: &[TreeDef]) -> std::fmt::Result {
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Self::Leaf => f.write_str("*"),
            Self::None => f.write_str("None"),
            Self::Tuple(children) => {
                f.write_str("(")?;
                join(f, children)?;
                if children.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::List(children) => {
                f.write_str("[")?;
                join(f, children)?;
                f.write_str("]")
            }
            Self::Dict(entries) => {
                f.write_str("{")?;
                for (idx, (key, child)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{key}': {child}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnflattenError {
    LeafCountMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for UnflattenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeafCountMismatch { expected, actual } => {
                write!(
                    f,
                    "tree definition expects {expected} children, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for UnflattenError {}

/// Leaves in depth-first order (dict entries by key) plus the structure.
#[must_use]
pub fn flatten(tree: &Tree) -> (Vec<Value>, TreeDef) {
    fn walk(tree: &Tree, leaves: &mut Vec<Value>) -> TreeDef {
        match tree {
            Tree::Leaf(value) => {
                leaves.push(value.clone());
                TreeDef::Leaf
            }
            Tree::None => TreeDef::None,
            Tree::Tuple(children) => {
                TreeDef::Tuple(children.iter().map(|c| walk(c, leaves)).collect())
            }
            Tree::List(children) => {
                TreeDef::List(children.iter().map(|c| walk(c, leaves)).collect())
            }
            Tree::Dict(entries) => TreeDef::Dict(
                entries
                    .iter()
                    .map(|(key, child)| (key.clone(), walk(child, leaves)))
                    .collect(),
            ),
        }
    }

    let mut leaves = Vec::new();
    let def = walk(tree, &mut leaves);
    (leaves, def)
}

/// Rebuilds a tree, placing `children` (which may themselves be subtrees)
/// at the leaf positions of `def` in order.
pub fn unflatten(def: &TreeDef, children: Vec<Tree>) -> Result<Tree, UnflattenError> {
    fn build(def: &TreeDef, children: &mut std::vec::IntoIter<Tree>) -> Option<Tree> {
        Some(match def {
            TreeDef::Leaf => children.next()?,
            TreeDef::None => Tree::None,
            TreeDef::Tuple(defs) => Tree::Tuple(
                defs.iter()
                    .map(|d| build(d, children))
                    .collect::<Option<_>>()?,
            ),
            TreeDef::List(defs) => Tree::List(
                defs.iter()
                    .map(|d| build(d, children))
                    .collect::<Option<_>>()?,
            ),
            TreeDef::Dict(entries) => Tree::Dict(
                entries
                    .iter()
                    .map(|(key, d)| build(d, children).map(|tree| (key.clone(), tree)))
                    .collect::<Option<_>>()?,
            ),
        })
    }

    let expected = def.num_leaves();
    if children.len() != expected {
        return Err(UnflattenError::LeafCountMismatch {
            expected,
            actual: children.len(),
        });
    }
    let mut iter = children.into_iter();
    build(def, &mut iter).ok_or(UnflattenError::LeafCountMismatch {
        expected,
        actual: 0,
    })
}

/// Hashable descriptor of a container's nesting shape.
pub trait ContainerShape: Clone + Eq + Hash + Debug + Send + Sync {
    /// The descriptor of a bare leaf (no nesting, one leaf).
    fn trivial() -> Self;

    fn leaf_count(&self) -> usize;

    fn is_trivial(&self) -> bool {
        *self == Self::trivial()
    }
}

impl ContainerShape for TreeDef {
    fn trivial() -> Self {
        Self::Leaf
    }

    fn leaf_count(&self) -> usize {
        self.num_leaves()
    }
}

/// Flatten/unflatten capability for one container family.
pub trait ContainerCodec {
    type Container: Clone + Debug;
    type Shape: ContainerShape;

    fn flatten(&self, container: &Self::Container) -> (Vec<Value>, Self::Shape);

    fn unflatten(
        &self,
        shape: &Self::Shape,
        children: Vec<Self::Container>,
    ) -> Result<Self::Container, UnflattenError>;

    fn leaf(&self, value: Value) -> Self::Container;
}

/// [`ContainerCodec`] over [`Tree`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PyTreeCodec;

impl ContainerCodec for PyTreeCodec {
    type Container = Tree;
    type Shape = TreeDef;

    fn flatten(&self, container: &Tree) -> (Vec<Value>, TreeDef) {
        flatten(container)
    }

    fn unflatten(&self, shape: &TreeDef, children: Vec<Tree>) -> Result<Tree, UnflattenError> {
        unflatten(shape, children)
    }

    fn leaf(&self, value: Value) -> Tree {
        Tree::Leaf(value)
    }
}

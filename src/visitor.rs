use std::collections::HashSet;

use crate::ast::NodeId;
use crate::builder::Builder;
use crate::error::CompilerError;

/// Read-only traversal over a settled tree.
///
/// Rules:
/// 1. Order is fixed: `enter(node)`, children left to right, `exit(node)`.
/// 2. Returning `Ok(false)` from `enter` skips the node's children; `exit`
///    still runs.
/// 3. The tree cannot change during a visit. Transforms belong in the
///    [`Walker`](crate::walker::Walker).
pub trait TreeVisitor {
    type Error;

    fn enter(&mut self, _builder: &Builder, _node: NodeId) -> Result<bool, Self::Error> {
        Ok(true)
    }

    fn exit(&mut self, _builder: &Builder, _node: NodeId) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub fn walk<V: TreeVisitor + ?Sized>(
    visitor: &mut V,
    builder: &Builder,
    node: NodeId,
) -> Result<(), V::Error> {
    if visitor.enter(builder, node)? {
        walk_children(visitor, builder, node)?;
    }
    visitor.exit(builder, node)
}

pub fn walk_children<V: TreeVisitor + ?Sized>(
    visitor: &mut V,
    builder: &Builder,
    node: NodeId,
) -> Result<(), V::Error> {
    for child in builder.children(node) {
        walk(visitor, builder, *child)?;
    }
    Ok(())
}

/// Checks that every reachable node has exactly one owner and that parent
/// links agree with child lists.
struct OwnershipCheck {
    seen: HashSet<NodeId>,
}

impl TreeVisitor for OwnershipCheck {
    type Error = CompilerError;

    fn enter(&mut self, builder: &Builder, node: NodeId) -> Result<bool, CompilerError> {
        if !self.seen.insert(node) {
            return Err(builder.detached_error(
                node,
                format!("Node {} is listed under more than one parent", node),
            ));
        }
        for child in builder.children(node) {
            if builder.parent(*child) != Some(node) {
                return Err(builder.detached_error(
                    *child,
                    format!("Node {} is listed under {} but not linked to it", child, node),
                ));
            }
        }
        Ok(true)
    }
}

/// Verify the single-owner invariant for the tree under `root`.
pub fn verify_tree(builder: &Builder, root: NodeId) -> Result<(), CompilerError> {
    let mut check = OwnershipCheck {
        seen: HashSet::new(),
    };
    walk(&mut check, builder, root)
}

//! Builder: the only sanctioned way to create and structurally edit nodes.
//!
//! The builder owns the node arena for one compilation. Ids are handed out
//! sequentially and double as stable debug identities. Structural operations
//! keep the single-owner invariant: a node is listed in at most one child list
//! and its `parent` always names that list's owner.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

use crate::ast::{Attribute, Node, NodeId, NodeKind, SourceLocation, WalkState};
use crate::error::{
    CompilerError, Diagnostic, ERR_DETACHED_NODE, ERR_INVALID_ATTRIBUTE, ERR_INVALID_NODE_KIND,
};
use crate::expression::{is_identifier, validate_code, Expression};

lazy_static! {
    static ref TAG_NAME_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9:._-]*$").unwrap();
    static ref ATTR_NAME_RE: Regex = Regex::new(r"^[^\s/>=\x22\x27]+$").unwrap();
}

#[derive(Debug, Clone)]
pub struct Builder {
    file_path: String,
    nodes: Vec<Node>,
}

impl Builder {
    pub fn new(file_path: impl Into<String>) -> Self {
        Builder {
            file_path: file_path.into(),
            nodes: Vec::new(),
        }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Number of nodes ever created, attached or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // READ ACCESS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Panics on an id from another builder; ids are never reused.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&Attribute> {
        self.node(id).attribute(name)
    }

    pub fn index_of(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.children(parent).iter().position(|c| *c == child)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let index = self.index_of(parent, id)?;
        self.children(parent).get(index + 1).copied()
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let index = self.index_of(parent, id)?;
        index
            .checked_sub(1)
            .and_then(|i| self.children(parent).get(i).copied())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CREATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create a detached node. Attribute values are parsed as expression
    /// fragments; children must be detached.
    pub fn create_node(
        &mut self,
        kind: NodeKind,
        attributes: Vec<(String, String)>,
        children: Vec<NodeId>,
    ) -> Result<NodeId, CompilerError> {
        self.create_node_at(SourceLocation::default(), kind, attributes, children)
    }

    pub fn create_node_at(
        &mut self,
        location: SourceLocation,
        kind: NodeKind,
        attributes: Vec<(String, String)>,
        children: Vec<NodeId>,
    ) -> Result<NodeId, CompilerError> {
        self.check_kind(&kind, location)?;

        let mut parsed = Vec::with_capacity(attributes.len());
        for (name, raw) in attributes {
            parsed.push(self.parse_attribute(&name, &raw, location)?);
        }
        if !kind.is_container() && !children.is_empty() {
            return Err(self.kind_error(
                location,
                format!("A {} node cannot have children", kind.name()),
            ));
        }
        let mut seen = HashSet::with_capacity(children.len());
        for child in &children {
            self.ensure_detached(*child)?;
            if !seen.insert(*child) {
                return Err(self.detached_error(
                    *child,
                    format!("Node {} is listed twice in the same child list", child),
                ));
            }
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            kind,
            attributes: parsed,
            children: Vec::new(),
            parent: None,
            location,
            preserve_whitespace: false,
            state: WalkState::Unvisited,
        });
        for child in children {
            self.nodes[child.index()].parent = Some(id);
            self.nodes[id.index()].children.push(child);
        }
        Ok(id)
    }

    /// Structurally independent copy with fresh ids. The copy is detached and
    /// unvisited.
    pub fn clone_node(&mut self, id: NodeId, deep: bool) -> NodeId {
        let source = self.node(id).clone();
        let copy = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id: copy,
            kind: source.kind,
            attributes: source.attributes,
            children: Vec::new(),
            parent: None,
            location: source.location,
            preserve_whitespace: source.preserve_whitespace,
            state: WalkState::Unvisited,
        });
        if deep {
            for child in source.children {
                let child_copy = self.clone_node(child, true);
                self.nodes[child_copy.index()].parent = Some(copy);
                self.nodes[copy.index()].children.push(child_copy);
            }
        }
        copy
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STRUCTURAL EDITS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), CompilerError> {
        self.ensure_container(parent)?;
        self.ensure_detached(child)?;
        self.ensure_not_ancestor(child, parent)?;
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.push(child);
        Ok(())
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: NodeId,
    ) -> Result<(), CompilerError> {
        let index = self.require_child(parent, reference)?;
        self.ensure_detached(child)?;
        self.ensure_not_ancestor(child, parent)?;
        self.nodes[child.index()].parent = Some(parent);
        self.nodes[parent.index()].children.insert(index, child);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), CompilerError> {
        let index = self.require_child(parent, child)?;
        self.nodes[parent.index()].children.remove(index);
        self.nodes[child.index()].parent = None;
        Ok(())
    }

    pub fn replace_child(
        &mut self,
        parent: NodeId,
        old_child: NodeId,
        new_child: NodeId,
    ) -> Result<(), CompilerError> {
        let index = self.require_child(parent, old_child)?;
        self.ensure_detached(new_child)?;
        self.ensure_not_ancestor(new_child, parent)?;
        self.nodes[parent.index()].children[index] = new_child;
        self.nodes[old_child.index()].parent = None;
        self.nodes[new_child.index()].parent = Some(parent);
        Ok(())
    }

    /// Remove `id` from its parent, if it has one.
    pub fn detach(&mut self, id: NodeId) -> Result<(), CompilerError> {
        match self.parent(id) {
            Some(parent) => self.remove_child(parent, id),
            None => Ok(()),
        }
    }

    /// Detach and return all children of `id`, in order.
    pub fn take_children(&mut self, id: NodeId) -> Vec<NodeId> {
        let children = std::mem::take(&mut self.nodes[id.index()].children);
        for child in &children {
            self.nodes[child.index()].parent = None;
        }
        children
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CONTENT EDITS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_kind(&mut self, id: NodeId, kind: NodeKind) -> Result<(), CompilerError> {
        let location = self.node(id).location;
        self.check_kind(&kind, location)?;
        if !kind.is_container() && !self.children(id).is_empty() {
            return Err(self.kind_error(
                location,
                format!("Cannot turn a node with children into a {} node", kind.name()),
            ));
        }
        self.nodes[id.index()].kind = kind;
        Ok(())
    }

    /// Set or overwrite an attribute, keeping its original position.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, raw: &str) -> Result<(), CompilerError> {
        let location = self.node(id).location;
        let attribute = self.parse_attribute(name, raw, location)?;
        let attributes = &mut self.nodes[id.index()].attributes;
        match attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => *existing = attribute,
            None => attributes.push(attribute),
        }
        Ok(())
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Option<Attribute> {
        let attributes = &mut self.nodes[id.index()].attributes;
        let index = attributes.iter().position(|a| a.name == name)?;
        Some(attributes.remove(index))
    }

    pub fn set_location(&mut self, id: NodeId, location: SourceLocation) {
        self.nodes[id.index()].location = location;
    }

    pub fn set_preserve_whitespace(&mut self, id: NodeId, preserve: bool) {
        self.nodes[id.index()].preserve_whitespace = preserve;
    }

    pub(crate) fn set_state(&mut self, id: NodeId, state: WalkState) {
        self.nodes[id.index()].state = state;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // VALIDATION
    // ═══════════════════════════════════════════════════════════════════════════

    fn kind_error(&self, at: SourceLocation, message: String) -> CompilerError {
        CompilerError::InvalidNodeKind(Diagnostic::error(
            ERR_INVALID_NODE_KIND,
            message,
            &self.file_path,
            at,
        ))
    }

    pub(crate) fn detached_error(&self, id: NodeId, message: String) -> CompilerError {
        let node = self.node(id);
        CompilerError::DetachedNode(
            Diagnostic::error(ERR_DETACHED_NODE, message, &self.file_path, node.location)
                .with_context(node.describe()),
        )
    }

    fn check_kind(&self, kind: &NodeKind, at: SourceLocation) -> Result<(), CompilerError> {
        let check_code = |what: &str, code: &str| {
            validate_code(code).map_err(|e| self.kind_error(at, format!("{}: {}", what, e)))
        };

        match kind {
            NodeKind::Element { tag } | NodeKind::CustomTag { name: tag, .. }
                if !TAG_NAME_RE.is_match(tag) =>
            {
                Err(self.kind_error(at, format!("Invalid tag name '{}'", tag)))
            }
            NodeKind::CustomTag { renderer, .. } if renderer.trim().is_empty() => {
                Err(self.kind_error(at, "Custom tags need a renderer".to_string()))
            }
            NodeKind::Comment { value, emit: true }
                if value.contains("--") || value.starts_with('>') || value.ends_with('-') =>
            {
                Err(self.kind_error(
                    at,
                    "HTML comments cannot contain `--`, start with `>` or end with `-`"
                        .to_string(),
                ))
            }
            NodeKind::Expression { code, .. } => check_code("Placeholder", code),
            NodeKind::Branch { test: Some(test) } => check_code("Branch test", test),
            NodeKind::Iteration {
                item,
                index,
                source,
            } => {
                for var in std::iter::once(item).chain(index.iter()) {
                    if !is_identifier(var) {
                        return Err(self.kind_error(
                            at,
                            format!("Loop variable '{}' is not an identifier", var),
                        ));
                    }
                }
                check_code("Loop source", source)
            }
            _ => Ok(()),
        }
    }

    fn parse_attribute(
        &self,
        name: &str,
        raw: &str,
        at: SourceLocation,
    ) -> Result<Attribute, CompilerError> {
        let invalid = |message: String| {
            CompilerError::InvalidAttribute(
                Diagnostic::error(ERR_INVALID_ATTRIBUTE, message, &self.file_path, at)
                    .with_context(format!("{}=\"{}\"", name, raw)),
            )
        };
        if !ATTR_NAME_RE.is_match(name) {
            return Err(invalid(format!("Invalid attribute name '{}'", name)));
        }
        let value = Expression::parse(raw)
            .map_err(|e| invalid(format!("Attribute '{}': {}", name, e.message)))?;
        Ok(Attribute {
            name: name.to_string(),
            value,
            location: at,
        })
    }

    fn ensure_container(&self, id: NodeId) -> Result<(), CompilerError> {
        let node = self.node(id);
        if node.kind.is_container() {
            Ok(())
        } else {
            Err(self.kind_error(
                node.location,
                format!("A {} node cannot have children", node.kind.name()),
            ))
        }
    }

    fn ensure_detached(&self, id: NodeId) -> Result<(), CompilerError> {
        match self.parent(id) {
            None => Ok(()),
            Some(parent) => Err(self.detached_error(
                id,
                format!("Node {} is already a child of {}; detach it first", id, parent),
            )),
        }
    }

    fn ensure_not_ancestor(&self, candidate: NodeId, of: NodeId) -> Result<(), CompilerError> {
        let mut current = Some(of);
        while let Some(id) = current {
            if id == candidate {
                return Err(self.detached_error(
                    candidate,
                    format!("Node {} cannot become its own descendant", candidate),
                ));
            }
            current = self.parent(id);
        }
        Ok(())
    }

    fn require_child(&self, parent: NodeId, child: NodeId) -> Result<usize, CompilerError> {
        self.index_of(parent, child).ok_or_else(|| {
            self.detached_error(
                child,
                format!("Node {} is not a child of {}", child, parent),
            )
        })
    }
}

//! Tree node model.
//!
//! Nodes live in an arena owned by the [`Builder`](crate::builder::Builder)
//! and are addressed by [`NodeId`]. Parent/child links are ids, so replacing a
//! subtree is an id swap rather than a deep copy. Only the builder mutates
//! structure; everything else reads through the accessors below.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::expression::Expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE KINDS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    /// Root of a template.
    Document,
    /// A markup element. Custom tags start out as elements until a taglib
    /// transform rewrites them.
    Element { tag: String },
    /// A tag bound to a runtime handler module.
    CustomTag { name: String, renderer: String },
    Text { value: String },
    /// `${code}` (escaped) or `$!{code}` (raw).
    Expression { code: String, escape: bool },
    /// Children are [`NodeKind::Branch`] nodes, evaluated in order.
    Conditional,
    /// `test == None` is the trailing `else` branch.
    Branch { test: Option<String> },
    Iteration {
        item: String,
        index: Option<String>,
        source: String,
    },
    /// `emit == false` comments are kept as code comments only.
    Comment { value: String, emit: bool },
    Doctype { name: String },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Document => "document",
            NodeKind::Element { .. } => "element",
            NodeKind::CustomTag { .. } => "custom-tag",
            NodeKind::Text { .. } => "text",
            NodeKind::Expression { .. } => "expression",
            NodeKind::Conditional => "conditional",
            NodeKind::Branch { .. } => "branch",
            NodeKind::Iteration { .. } => "iteration",
            NodeKind::Comment { .. } => "comment",
            NodeKind::Doctype { .. } => "doctype",
        }
    }

    /// Tag name used for taglib lookup.
    pub fn tag_name(&self) -> Option<&str> {
        match self {
            NodeKind::Element { tag } => Some(tag),
            NodeKind::CustomTag { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Whether this kind may carry children.
    pub fn is_container(&self) -> bool {
        !matches!(
            self,
            NodeKind::Text { .. }
                | NodeKind::Expression { .. }
                | NodeKind::Comment { .. }
                | NodeKind::Doctype { .. }
        )
    }
}

/// Per-node traversal state used by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WalkState {
    #[default]
    Unvisited,
    Entering,
    Entered,
    Exiting,
    Settled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    pub value: Expression,
    #[serde(default)]
    pub location: SourceLocation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) location: SourceLocation,
    pub(crate) preserve_whitespace: bool,
    pub(crate) state: WalkState,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn location(&self) -> SourceLocation {
        self.location
    }

    pub fn preserves_whitespace(&self) -> bool {
        self.preserve_whitespace
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    pub fn tag_name(&self) -> Option<&str> {
        self.kind.tag_name()
    }

    /// Text nodes made only of whitespace.
    pub fn is_blank_text(&self) -> bool {
        matches!(&self.kind, NodeKind::Text { value } if value.trim().is_empty())
    }

    /// Short human-readable label for diagnostics.
    pub fn describe(&self) -> String {
        match self.kind.tag_name() {
            Some(tag) => format!("<{}>", tag),
            None => self.kind.name().to_string(),
        }
    }
}

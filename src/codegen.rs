//! Code generator.
//!
//! Lowers a settled tree into a [`Fragment`] tree that mirrors it node for
//! node, then prints the fragments as a CommonJS module:
//!
//! ```text
//! module.exports = function create(__helpers) {
//!   var str = __helpers.s, ...;
//!   var card_tag = loadTag(require("./card"));   // hoisted tag handlers
//!
//!   return function render(data, out) {
//!     out.w("<div>Hello</div>");
//!   };
//! };
//! ```
//!
//! The generator applies no taglib semantics. A node kind that reaches it in
//! an impossible position fails with `UnsupportedNodeKind`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::ast::{NodeId, NodeKind};
use crate::builder::Builder;
use crate::config::PreserveWhitespace;
use crate::error::{CompilerError, Diagnostic, ERR_UNSUPPORTED_NODE};
use crate::expression::{js_string, Expression};
use crate::scope::{identifier_hint, Declaration, ScopeStack};
use crate::visitor::{walk, TreeVisitor};

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref VOID_TAGS: HashSet<&'static str> = [
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ]
    .into_iter()
    .collect();
}

/// Elements that never have content or a closing tag.
pub fn is_void_tag(tag: &str) -> bool {
    VOID_TAGS.contains(tag.to_ascii_lowercase().as_str())
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AttributeValue {
    Static { value: String },
    /// JavaScript expression, already scope-resolved.
    Dynamic { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeCode {
    pub name: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCode {
    /// `None` for the trailing `else`.
    pub test: Option<String>,
    pub body: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Fragment {
    Element {
        tag: String,
        attributes: Vec<AttributeCode>,
        children: Vec<Fragment>,
    },
    /// Static text. `escape == false` inside raw-text elements.
    Text { value: String, escape: bool },
    /// Render-time value.
    Write { code: String, escape: bool },
    Comment { value: String, emit: bool },
    Doctype { name: String },
    TagCall {
        name: String,
        handler: String,
        attributes: Vec<AttributeCode>,
        body: Vec<Fragment>,
    },
    Branching { branches: Vec<BranchCode> },
    Loop {
        item: String,
        index: String,
        list: String,
        source: String,
        body: Vec<Fragment>,
    },
}

/// The artifact of one compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeUnit {
    pub file_path: String,
    /// Empty when the unit was loaded from up-to-date output on disk.
    pub fragments: Vec<Fragment>,
    pub hoisted: Vec<Declaration>,
    pub code: String,
    pub warnings: Vec<Diagnostic>,
    pub from_cache: bool,
}

impl CodeUnit {
    pub fn cached(file_path: &str, code: String) -> Self {
        CodeUnit {
            file_path: file_path.to_string(),
            fragments: Vec::new(),
            hoisted: Vec::new(),
            code,
            warnings: Vec::new(),
            from_cache: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOWERING
// ═══════════════════════════════════════════════════════════════════════════════

enum Pending {
    Document,
    Element {
        tag: String,
        attributes: Vec<AttributeCode>,
    },
    TagCall {
        name: String,
        handler: String,
        attributes: Vec<AttributeCode>,
    },
    Conditional {
        branches: Vec<BranchCode>,
    },
    Branch {
        test: Option<String>,
    },
    Loop {
        item: String,
        index: String,
        list: String,
        source: String,
    },
}

struct Frame {
    node: NodeId,
    pending: Pending,
    children: Vec<Fragment>,
    preserve: bool,
    raw_text: bool,
}

struct Lowering<'a> {
    whitespace: &'a PreserveWhitespace,
    scope: ScopeStack,
    frames: Vec<Frame>,
    output: Vec<Fragment>,
}

fn unsupported(builder: &Builder, node: NodeId, message: String) -> CompilerError {
    let n = builder.node(node);
    CompilerError::UnsupportedNodeKind(
        Diagnostic::error(ERR_UNSUPPORTED_NODE, message, builder.file_path(), n.location())
            .with_context(n.describe()),
    )
}

impl<'a> Lowering<'a> {
    fn preserving(&self) -> bool {
        self.whitespace.everywhere() || self.frames.last().map(|f| f.preserve).unwrap_or(false)
    }

    fn in_raw_text(&self) -> bool {
        self.frames.last().map(|f| f.raw_text).unwrap_or(false)
    }

    fn emit(&mut self, fragment: Fragment) {
        match self.frames.last_mut() {
            Some(frame) => frame.children.push(fragment),
            None => self.output.push(fragment),
        }
    }

    fn attributes(&self, builder: &Builder, node: NodeId) -> Vec<AttributeCode> {
        let resolve = |code: &str| self.scope.resolve(code);
        builder
            .node(node)
            .attributes()
            .iter()
            .map(|attr| AttributeCode {
                name: attr.name.clone(),
                value: attribute_value(&attr.value, &resolve),
            })
            .collect()
    }

    fn open(&mut self, node: NodeId, pending: Pending, preserve: bool, raw_text: bool) {
        self.frames.push(Frame {
            node,
            pending,
            children: Vec::new(),
            preserve,
            raw_text,
        });
    }

    fn check_position(&self, builder: &Builder, node: NodeId) -> Result<(), CompilerError> {
        let kind = builder.kind(node);
        let parent = self.frames.last().map(|f| &f.pending);
        match (kind, parent) {
            (NodeKind::Document, None) if self.output.is_empty() => Ok(()),
            (NodeKind::Document, _) => Err(unsupported(
                builder,
                node,
                "A document node can only be the root".to_string(),
            )),
            (NodeKind::Branch { .. }, Some(Pending::Conditional { branches })) => {
                match branches.last() {
                    Some(BranchCode { test: None, .. }) => Err(unsupported(
                        builder,
                        node,
                        "A branch cannot follow the else branch".to_string(),
                    )),
                    _ => Ok(()),
                }
            }
            (NodeKind::Branch { .. }, _) => Err(unsupported(
                builder,
                node,
                "A branch must be a child of a conditional".to_string(),
            )),
            (_, Some(Pending::Conditional { .. })) => Err(unsupported(
                builder,
                node,
                format!("A conditional cannot contain a {} node", kind.name()),
            )),
            _ => Ok(()),
        }
    }
}

fn attribute_value(value: &Expression, resolve: &dyn Fn(&str) -> String) -> AttributeValue {
    match value.static_value() {
        Some(value) => AttributeValue::Static { value },
        None => AttributeValue::Dynamic {
            code: value.to_js(resolve),
        },
    }
}

impl<'a> TreeVisitor for Lowering<'a> {
    type Error = CompilerError;

    fn enter(&mut self, builder: &Builder, node: NodeId) -> Result<bool, CompilerError> {
        self.check_position(builder, node)?;
        let parent_preserve = self.preserving();
        let n = builder.node(node);

        match n.kind() {
            NodeKind::Document => self.open(node, Pending::Document, parent_preserve, false),
            NodeKind::Element { tag } => {
                let lower = tag.to_ascii_lowercase();
                let preserve = parent_preserve
                    || n.preserves_whitespace()
                    || self.whitespace.preserves(tag);
                let raw_text = lower == "script" || lower == "style";
                let attributes = self.attributes(builder, node);
                self.open(
                    node,
                    Pending::Element {
                        tag: tag.clone(),
                        attributes,
                    },
                    preserve,
                    raw_text,
                );
            }
            NodeKind::CustomTag { name, renderer } => {
                let handler = self.scope.hoist(
                    &format!("{}_tag", identifier_hint(name)),
                    format!("loadTag(require({}))", js_string(renderer)),
                );
                let attributes = self.attributes(builder, node);
                let preserve = parent_preserve || n.preserves_whitespace();
                self.open(
                    node,
                    Pending::TagCall {
                        name: name.clone(),
                        handler,
                        attributes,
                    },
                    preserve,
                    false,
                );
            }
            NodeKind::Conditional => self.open(
                node,
                Pending::Conditional {
                    branches: Vec::new(),
                },
                parent_preserve,
                false,
            ),
            NodeKind::Branch { test } => {
                let test = test.as_deref().map(|t| self.scope.resolve(t));
                let raw_text = self.in_raw_text();
                self.open(node, Pending::Branch { test }, parent_preserve, raw_text);
            }
            NodeKind::Iteration {
                item,
                index,
                source,
            } => {
                // The source is evaluated outside the loop's own bindings.
                let source = self.scope.resolve(source);
                self.scope.push();
                let emitted_item = self.scope.declare(item);
                let emitted_index = match index {
                    Some(index) => self.scope.declare(index),
                    None => self.scope.declare(&format!("{}_index", item)),
                };
                let list = self.scope.declare(&format!("{}_list", item));
                let raw_text = self.in_raw_text();
                self.open(
                    node,
                    Pending::Loop {
                        item: emitted_item,
                        index: emitted_index,
                        list,
                        source,
                    },
                    parent_preserve,
                    raw_text,
                );
            }
            NodeKind::Text { value } => {
                let fragment = if self.in_raw_text() {
                    Some(Fragment::Text {
                        value: value.clone(),
                        escape: false,
                    })
                } else if parent_preserve {
                    Some(Fragment::Text {
                        value: value.clone(),
                        escape: true,
                    })
                } else {
                    collapse_whitespace(value).map(|value| Fragment::Text {
                        value,
                        escape: true,
                    })
                };
                if let Some(fragment) = fragment {
                    self.emit(fragment);
                }
            }
            NodeKind::Expression { code, escape } => {
                let code = self.scope.resolve(code);
                self.emit(Fragment::Write {
                    code,
                    escape: *escape,
                });
            }
            NodeKind::Comment { value, emit } => self.emit(Fragment::Comment {
                value: value.clone(),
                emit: *emit,
            }),
            NodeKind::Doctype { name } => self.emit(Fragment::Doctype { name: name.clone() }),
        }
        Ok(true)
    }

    fn exit(&mut self, _builder: &Builder, node: NodeId) -> Result<(), CompilerError> {
        let frame = match self.frames.last() {
            Some(frame) if frame.node == node => self.frames.pop(),
            _ => None,
        };
        let frame = match frame {
            Some(frame) => frame,
            None => return Ok(()),
        };

        let fragment = match frame.pending {
            Pending::Document => {
                self.output.extend(frame.children);
                return Ok(());
            }
            Pending::Element { tag, attributes } => Fragment::Element {
                tag,
                attributes,
                children: frame.children,
            },
            Pending::TagCall {
                name,
                handler,
                attributes,
            } => Fragment::TagCall {
                name,
                handler,
                attributes,
                body: frame.children,
            },
            Pending::Conditional { branches } => Fragment::Branching { branches },
            Pending::Branch { test } => {
                if let Some(Frame {
                    pending: Pending::Conditional { branches },
                    ..
                }) = self.frames.last_mut()
                {
                    branches.push(BranchCode {
                        test,
                        body: frame.children,
                    });
                }
                return Ok(());
            }
            Pending::Loop {
                item,
                index,
                list,
                source,
            } => {
                self.scope.pop();
                Fragment::Loop {
                    item,
                    index,
                    list,
                    source,
                    body: frame.children,
                }
            }
        };
        self.emit(fragment);
        Ok(())
    }
}

/// Outside preserved regions: whitespace runs inside text become one space,
/// runs at either edge are dropped when they contain a line break, and
/// whitespace-only text spanning lines disappears.
pub fn collapse_whitespace(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    let rest = value.trim_start();
    let leading = &value[..value.len() - rest.len()];
    if rest.is_empty() {
        return if value.contains('\n') {
            None
        } else {
            Some(" ".to_string())
        };
    }
    let body = rest.trim_end();
    let trailing = &rest[body.len()..];

    let mut out = String::with_capacity(value.len());
    if !leading.is_empty() && !leading.contains('\n') {
        out.push(' ');
    }
    out.push_str(&WHITESPACE_RE.replace_all(body, " "));
    if !trailing.is_empty() && !trailing.contains('\n') {
        out.push(' ');
    }
    Some(out)
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATOR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct CodeGenerator {
    whitespace: PreserveWhitespace,
}

impl CodeGenerator {
    pub fn new(whitespace: &PreserveWhitespace) -> Self {
        CodeGenerator {
            whitespace: whitespace.clone(),
        }
    }

    /// Lower the settled tree under `root` into a [`CodeUnit`].
    pub fn generate_code(&self, builder: &Builder, root: NodeId) -> Result<CodeUnit, CompilerError> {
        let mut lowering = Lowering {
            whitespace: &self.whitespace,
            scope: ScopeStack::new(),
            frames: Vec::new(),
            output: Vec::new(),
        };
        walk(&mut lowering, builder, root)?;

        let hoisted = lowering.scope.hoisted().to_vec();
        let code = print_module(&lowering.output, &hoisted);
        Ok(CodeUnit {
            file_path: builder.file_path().to_string(),
            fragments: lowering.output,
            hoisted,
            code,
            warnings: Vec::new(),
            from_cache: false,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRINTER
// ═══════════════════════════════════════════════════════════════════════════════

pub fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Accumulates static markup and flushes it as a single `out.w(...)` before
/// the next statement.
struct Printer {
    out: String,
    pending: String,
    indent: usize,
}

impl Printer {
    fn new(indent: usize) -> Self {
        Printer {
            out: String::new(),
            pending: String::new(),
            indent,
        }
    }

    fn raw_line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            let literal = js_string(&std::mem::take(&mut self.pending));
            self.raw_line(&format!("out.w({});", literal));
        }
    }

    fn line(&mut self, text: &str) {
        self.flush();
        self.raw_line(text);
    }

    fn write(&mut self, markup: &str) {
        self.pending.push_str(markup);
    }

    fn indented(&mut self, f: impl FnOnce(&mut Printer)) {
        self.flush();
        self.indent += 1;
        f(self);
        self.flush();
        self.indent -= 1;
    }
}

fn attribute_js(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Static { value } => js_string(value),
        AttributeValue::Dynamic { code } => code.clone(),
    }
}

fn print_fragments(p: &mut Printer, fragments: &[Fragment]) {
    for fragment in fragments {
        print_fragment(p, fragment);
    }
}

fn print_fragment(p: &mut Printer, fragment: &Fragment) {
    match fragment {
        Fragment::Element {
            tag,
            attributes,
            children,
        } => {
            p.write(&format!("<{}", tag));
            for attr in attributes {
                match &attr.value {
                    AttributeValue::Static { value } if value.is_empty() => {
                        p.write(&format!(" {}", attr.name))
                    }
                    AttributeValue::Static { value } => {
                        p.write(&format!(" {}=\"{}\"", attr.name, escape_attribute(value)))
                    }
                    AttributeValue::Dynamic { code } => p.line(&format!(
                        "out.w(attr({}, {}));",
                        js_string(&attr.name),
                        code
                    )),
                }
            }
            p.write(">");
            if !is_void_tag(tag) {
                print_fragments(p, children);
                p.write(&format!("</{}>", tag));
            }
        }
        Fragment::Text { value, escape } => {
            if *escape {
                p.write(&escape_xml(value));
            } else {
                p.write(value);
            }
        }
        Fragment::Write { code, escape } => {
            let helper = if *escape { "escapeXml" } else { "str" };
            p.line(&format!("out.w({}({}));", helper, code));
        }
        Fragment::Comment { value, emit: true } => p.write(&format!("<!--{}-->", value)),
        Fragment::Comment { value, emit: false } => {
            for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
                p.line(&format!("// {}", line));
            }
        }
        Fragment::Doctype { name } => p.write(&format!("<!DOCTYPE {}>", name)),
        Fragment::TagCall {
            handler,
            attributes,
            body,
            ..
        } => {
            if attributes.is_empty() && body.is_empty() {
                p.line(&format!("{}({{}}, out);", handler));
                return;
            }
            p.line(&format!("{}({{", handler));
            p.indented(|p| {
                for (i, attr) in attributes.iter().enumerate() {
                    let comma = if i + 1 < attributes.len() || !body.is_empty() {
                        ","
                    } else {
                        ""
                    };
                    p.line(&format!(
                        "{}: {}{}",
                        js_string(&attr.name),
                        attribute_js(&attr.value),
                        comma
                    ));
                }
                if !body.is_empty() {
                    p.line("renderBody: function(out) {");
                    p.indented(|p| print_fragments(p, body));
                    p.line("}");
                }
            });
            p.line("}, out);");
        }
        Fragment::Branching { branches } => {
            for (i, branch) in branches.iter().enumerate() {
                let head = match (i, &branch.test) {
                    (0, Some(test)) => format!("if ({}) {{", test),
                    (0, None) => "if (true) {".to_string(),
                    (_, Some(test)) => format!("}} else if ({}) {{", test),
                    (_, None) => "} else {".to_string(),
                };
                p.line(&head);
                p.indented(|p| print_fragments(p, &branch.body));
            }
            if !branches.is_empty() {
                p.line("}");
            }
        }
        Fragment::Loop {
            item,
            index,
            list,
            source,
            body,
        } => {
            p.line(&format!("var {}, {}, {};", item, index, list));
            p.line(&format!(
                "for ({list} = ({source}) || [], {index} = 0; {index} < {list}.length; {index}++) {{",
                list = list,
                source = source,
                index = index
            ));
            p.indented(|p| {
                p.line(&format!("{} = {}[{}];", item, list, index));
                print_fragments(p, body);
            });
            p.line("}");
        }
    }
}

fn print_module(fragments: &[Fragment], hoisted: &[Declaration]) -> String {
    let mut p = Printer::new(0);
    p.line("module.exports = function create(__helpers) {");
    p.indented(|p| {
        p.line("var str = __helpers.s,");
        p.line("  escapeXml = __helpers.x,");
        p.line("  attr = __helpers.a,");
        p.line("  loadTag = __helpers.t;");
        for declaration in hoisted {
            p.line(&format!("var {} = {};", declaration.name, declaration.init));
        }
        p.out.push('\n');
        p.line("return function render(data, out) {");
        p.indented(|p| print_fragments(p, fragments));
        p.line("};");
    });
    p.line("};");
    p.out
}

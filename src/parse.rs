//! Default template parser, built on `html5ever`.
//!
//! Placeholders are swapped for inert tokens before the HTML parser runs, so
//! code such as `${a > b}` cannot confuse the tokenizer. The DOM is then
//! converted into builder nodes: tokens in text become `Expression` nodes,
//! tokens in attribute values are restored and parsed as fragments.

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use lazy_static::lazy_static;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use regex::{Captures, Regex};

use crate::ast::{NodeId, NodeKind, SourceLocation};
use crate::builder::Builder;
use crate::codegen::is_void_tag;
use crate::error::{CompilerError, Diagnostic, ERR_PARSE};
use crate::expression::{scan_placeholders, unescape_static, validate_code, Placeholder};

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"__tpl_expr_(\d+)__").unwrap();
    static ref SELF_CLOSING_RE: Regex =
        Regex::new(r"<([A-Za-z][A-Za-z0-9:._-]*)((?:\s[^<>]*?)?)\s*/>").unwrap();
}

/// Produces the raw tree for a template.
pub trait TemplateParser: Send + Sync {
    /// Parse `source` into nodes created through `builder`; returns the root.
    fn parse(&self, source: &str, builder: &mut Builder) -> Result<NodeId, CompilerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlParser;

impl TemplateParser for HtmlParser {
    fn parse(&self, source: &str, builder: &mut Builder) -> Result<NodeId, CompilerError> {
        let lines = LineIndex::new(source);
        let file_path = builder.file_path().to_string();
        let parse_error = |message: String, offset: usize| {
            CompilerError::Parse(Diagnostic::error(
                ERR_PARSE,
                message,
                &file_path,
                lines.location(offset),
            ))
        };

        let placeholders =
            scan_placeholders(source).map_err(|e| parse_error(e.message, e.offset))?;
        let normalized = convert_self_closing(&tokenize(source, &placeholders));

        let dom = parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .read_from(&mut normalized.as_bytes())
            .map_err(|e| parse_error(format!("Failed to parse markup: {}", e), 0))?;

        let mut converter = Converter {
            source,
            placeholders: &placeholders,
            lines: &lines,
            masked: masked_lowercase(source, &placeholders),
            cursor: 0,
            flatten_wrappers: !source.to_ascii_lowercase().contains("<html"),
            builder,
        };
        let root = converter.builder.create_node_at(
            SourceLocation::new(1, 1),
            NodeKind::Document,
            vec![],
            vec![],
        )?;
        converter.children(&dom.document, root, SourceLocation::new(1, 1))?;
        Ok(root)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRE-PASSES
// ═══════════════════════════════════════════════════════════════════════════════

fn tokenize(source: &str, placeholders: &[Placeholder]) -> String {
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for (i, p) in placeholders.iter().enumerate() {
        out.push_str(&source[last..p.start]);
        out.push_str(&format!("__tpl_expr_{}__", i));
        last = p.end;
    }
    out.push_str(&source[last..]);
    out
}

/// HTML treats `<fancy-box />` as an open tag, which would swallow the
/// following siblings.
fn convert_self_closing(html: &str) -> String {
    SELF_CLOSING_RE
        .replace_all(html, |caps: &Captures| {
            let tag = &caps[1];
            if is_void_tag(tag) {
                caps[0].to_string()
            } else {
                format!("<{}{}></{}>", tag, &caps[2], tag)
            }
        })
        .to_string()
}

/// Lowercased source with placeholder bytes blanked, for locating tags.
fn masked_lowercase(source: &str, placeholders: &[Placeholder]) -> String {
    let mut bytes = source.to_ascii_lowercase().into_bytes();
    for p in placeholders {
        for b in &mut bytes[p.start..p.end] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    }
    // Placeholder ranges are whole characters, so blanking them keeps UTF-8.
    String::from_utf8(bytes).unwrap_or_default()
}

struct LineIndex<'s> {
    source: &'s str,
    starts: Vec<usize>,
}

impl<'s> LineIndex<'s> {
    fn new(source: &'s str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        LineIndex { source, starts }
    }

    fn location(&self, offset: usize) -> SourceLocation {
        let offset = offset.min(self.source.len());
        let line = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let start = self.starts[line];
        let column = self
            .source
            .get(start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        SourceLocation::new(line as u32 + 1, column as u32 + 1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOM CONVERSION
// ═══════════════════════════════════════════════════════════════════════════════

struct Converter<'a> {
    source: &'a str,
    placeholders: &'a [Placeholder],
    lines: &'a LineIndex<'a>,
    masked: String,
    cursor: usize,
    flatten_wrappers: bool,
    builder: &'a mut Builder,
}

impl<'a> Converter<'a> {
    fn parse_error(&self, message: String, at: SourceLocation) -> CompilerError {
        CompilerError::Parse(Diagnostic::error(
            ERR_PARSE,
            message,
            self.builder.file_path(),
            at,
        ))
    }

    fn placeholder(&self, token: &Captures) -> Option<&'a Placeholder> {
        token[1]
            .parse::<usize>()
            .ok()
            .and_then(|i| self.placeholders.get(i))
    }

    /// Put the original `${…}` text back in place of tokens.
    fn restore(&self, text: &str) -> String {
        TOKEN_RE
            .replace_all(text, |caps: &Captures| match self.placeholder(caps) {
                Some(p) => self.source[p.start..p.end].to_string(),
                None => caps[0].to_string(),
            })
            .to_string()
    }

    /// Source position of the next `<tag` at or after the cursor. Tags the
    /// HTML parser implied have no position of their own.
    fn locate(&mut self, tag: &str) -> Option<SourceLocation> {
        let needle = format!("<{}", tag.to_ascii_lowercase());
        let mut from = self.cursor;
        while let Some(found) = self.masked.get(from..).and_then(|s| s.find(&needle)) {
            let start = from + found;
            let after = self.masked.as_bytes().get(start + needle.len()).copied();
            let boundary = match after {
                None | Some(b'>') | Some(b'/') => true,
                Some(b) => b.is_ascii_whitespace(),
            };
            if boundary {
                self.cursor = start + 1;
                return Some(self.lines.location(start));
            }
            from = start + 1;
        }
        None
    }

    fn append(
        &mut self,
        parent: NodeId,
        at: SourceLocation,
        kind: NodeKind,
        attributes: Vec<(String, String)>,
    ) -> Result<NodeId, CompilerError> {
        let id = self.builder.create_node_at(at, kind, attributes, vec![])?;
        self.builder.append_child(parent, id)?;
        Ok(id)
    }

    fn children(
        &mut self,
        handle: &Handle,
        parent: NodeId,
        at: SourceLocation,
    ) -> Result<(), CompilerError> {
        for child in handle.children.borrow().iter() {
            self.node(child, parent, at)?;
        }
        Ok(())
    }

    fn node(
        &mut self,
        handle: &Handle,
        parent: NodeId,
        at: SourceLocation,
    ) -> Result<(), CompilerError> {
        match &handle.data {
            NodeData::Document => self.children(handle, parent, at),
            NodeData::Doctype { name, .. } => {
                self.append(
                    parent,
                    at,
                    NodeKind::Doctype {
                        name: name.to_string(),
                    },
                    vec![],
                )?;
                Ok(())
            }
            NodeData::Text { contents } => {
                let text = contents.borrow().to_string();
                self.text(&text, parent, at)
            }
            NodeData::Comment { contents } => {
                let value = self.restore(contents);
                self.append(parent, at, NodeKind::Comment { value, emit: false }, vec![])?;
                Ok(())
            }
            NodeData::Element {
                name,
                attrs,
                template_contents,
                ..
            } => {
                let tag = name.local.to_string();
                let location = self.locate(&tag);
                let is_wrapper = matches!(tag.as_str(), "html" | "head" | "body");
                if is_wrapper && self.flatten_wrappers && location.is_none() {
                    return self.children(handle, parent, at);
                }
                let location = location.unwrap_or(at);

                let attributes = attrs
                    .borrow()
                    .iter()
                    .map(|attr| {
                        let name = match &attr.name.prefix {
                            Some(prefix) => format!("{}:{}", prefix, attr.name.local),
                            None => attr.name.local.to_string(),
                        };
                        (name, self.restore(&attr.value))
                    })
                    .collect();
                let id = self.append(parent, location, NodeKind::Element { tag }, attributes)?;

                match template_contents.borrow().as_ref() {
                    Some(contents) => self.children(contents, id, location),
                    None => self.children(handle, id, location),
                }
            }
            NodeData::ProcessingInstruction { .. } => Ok(()),
        }
    }

    /// Split text around tokens into `Text` and `Expression` nodes.
    fn text(&mut self, text: &str, parent: NodeId, at: SourceLocation) -> Result<(), CompilerError> {
        let mut last = 0;
        for caps in TOKEN_RE.captures_iter(text) {
            let whole = match caps.get(0) {
                Some(m) => m,
                None => continue,
            };
            let placeholder = match self.placeholder(&caps) {
                Some(p) => p,
                None => continue,
            };
            if whole.start() > last {
                self.literal(&text[last..whole.start()], parent, at)?;
            }
            let location = self.lines.location(placeholder.start);
            validate_code(&placeholder.code).map_err(|e| self.parse_error(e, location))?;
            self.append(
                parent,
                location,
                NodeKind::Expression {
                    code: placeholder.code.clone(),
                    escape: placeholder.escape,
                },
                vec![],
            )?;
            last = whole.end();
        }
        if last < text.len() {
            self.literal(&text[last..], parent, at)?;
        }
        Ok(())
    }

    fn literal(&mut self, text: &str, parent: NodeId, at: SourceLocation) -> Result<(), CompilerError> {
        self.append(
            parent,
            at,
            NodeKind::Text {
                value: unescape_static(text),
            },
            vec![],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Builder, NodeId) {
        let mut builder = Builder::new("views/page.html");
        let root = HtmlParser.parse(source, &mut builder).unwrap();
        (builder, root)
    }

    fn tag(b: &Builder, id: NodeId) -> &str {
        b.node(id).tag_name().unwrap_or("")
    }

    #[test]
    fn test_fragment_is_not_wrapped() {
        let (b, root) = parse("<div>Hello</div>");
        assert_eq!(b.kind(root), &NodeKind::Document);
        let children = b.children(root);
        assert_eq!(children.len(), 1);
        assert_eq!(tag(&b, children[0]), "div");
        let text = b.children(children[0])[0];
        assert_eq!(
            b.kind(text),
            &NodeKind::Text {
                value: "Hello".to_string()
            }
        );
    }

    #[test]
    fn test_full_document_keeps_wrappers() {
        let (b, root) = parse("<!DOCTYPE html><html><head></head><body><p>x</p></body></html>");
        let children = b.children(root);
        assert_eq!(
            b.kind(children[0]),
            &NodeKind::Doctype {
                name: "html".to_string()
            }
        );
        assert_eq!(tag(&b, children[1]), "html");
    }

    #[test]
    fn test_placeholders_in_text_and_attributes() {
        let (b, root) = parse(r#"<p class="a ${data.cls}">Hi ${data.name}, $!{data.html} \${x}</p>"#);
        let p = b.children(root)[0];
        assert!(!b.attribute(p, "class").unwrap().value.is_static());

        let kinds: Vec<&NodeKind> = b.children(p).iter().map(|c| b.kind(*c)).collect();
        assert_eq!(
            kinds,
            vec![
                &NodeKind::Text {
                    value: "Hi ".to_string()
                },
                &NodeKind::Expression {
                    code: "data.name".to_string(),
                    escape: true
                },
                &NodeKind::Text {
                    value: ", ".to_string()
                },
                &NodeKind::Expression {
                    code: "data.html".to_string(),
                    escape: false
                },
                &NodeKind::Text {
                    value: " ${x}".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_comparison_inside_placeholder() {
        let (b, root) = parse("<p>${a > b ? '<b>' : c}</p>");
        let p = b.children(root)[0];
        assert_eq!(b.children(p).len(), 1);
    }

    #[test]
    fn test_self_closing_custom_tag() {
        let (b, root) = parse("<div><fancy-box title=\"x\"/><span>after</span></div>");
        let div = b.children(root)[0];
        let children: Vec<&str> = b.children(div).iter().map(|c| tag(&b, *c)).collect();
        assert_eq!(children, vec!["fancy-box", "span"]);
        assert_eq!(
            convert_self_closing("<br/><x-y a=\"1\" />"),
            "<br/><x-y a=\"1\"></x-y>"
        );
    }

    #[test]
    fn test_element_positions() {
        let (b, root) = parse("<div>\n  <span>a</span>\n  <em>${x}</em>\n</div>");
        let div = b.children(root)[0];
        assert_eq!(b.node(div).location(), SourceLocation::new(1, 1));
        let elements: Vec<NodeId> = b
            .children(div)
            .iter()
            .copied()
            .filter(|c| b.node(*c).tag_name().is_some())
            .collect();
        assert_eq!(b.node(elements[0]).location(), SourceLocation::new(2, 3));
        assert_eq!(b.node(elements[1]).location(), SourceLocation::new(3, 3));
        let expr = b.children(elements[1])[0];
        assert_eq!(b.node(expr).location(), SourceLocation::new(3, 7));
    }

    #[test]
    fn test_comments_are_kept_unemitted() {
        let (b, root) = parse("<!-- note --><p></p>");
        assert_eq!(
            b.kind(b.children(root)[0]),
            &NodeKind::Comment {
                value: " note ".to_string(),
                emit: false
            }
        );
    }

    #[test]
    fn test_unbalanced_placeholder_is_parse_error() {
        let mut builder = Builder::new("views/page.html");
        let err = HtmlParser
            .parse("<p>\n  ${data.name</p>", &mut builder)
            .unwrap_err();
        match err {
            CompilerError::Parse(d) => {
                assert_eq!(d.line, 2);
                assert_eq!(d.column, 3);
            }
            other => panic!("expected parse error, got {:?}", other),
        }

        let err = HtmlParser
            .parse("<p>${a +}</p>", &mut Builder::new("x.html"))
            .unwrap_err();
        assert!(matches!(err, CompilerError::Parse(_)));
    }
}

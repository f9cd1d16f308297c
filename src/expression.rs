//! Expression fragments.
//!
//! Attribute values and text placeholders are not plain strings: a value such
//! as `btn ${data.kind}` is a sequence of static segments and JavaScript code
//! segments. Code segments are validated with `oxc_parser` and, during code
//! generation, rewritten with an `oxc` visitor when a scope renamed a binding.

use oxc_allocator::Allocator;
use oxc_ast::ast::{
    ArrowFunctionExpression, BindingIdentifier, Expression as JsExpression, FormalParameters,
    Function, IdentifierReference, ObjectProperty,
};
use oxc_ast_visit::{walk, Visit};
use oxc_parser::Parser;
use oxc_span::SourceType;
use oxc_syntax::scope::ScopeFlags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionError {
    pub message: String,
    /// Byte offset into the fragment where the problem starts.
    pub offset: usize,
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at offset {})", self.message, self.offset)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLACEHOLDER SCANNING
// ═══════════════════════════════════════════════════════════════════════════════

/// A `${…}` / `$!{…}` occurrence in a larger string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placeholder {
    pub start: usize,
    pub end: usize,
    pub code: String,
    pub escape: bool,
}

/// Find the end of a balanced brace expression, handling strings and template
/// literals. `start` must point at `{`. Returns the byte index after the
/// closing brace.
pub(crate) fn find_balanced_brace_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = start;
    let mut in_string: Option<u8> = None;
    let mut in_template_literal = false;
    let mut template_brace_depth = 0usize;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'\\' && i + 1 < bytes.len() {
            i += 2;
            continue;
        }

        if let Some(quote) = in_string {
            if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }

        if in_template_literal {
            if c == b'`' && template_brace_depth == 0 {
                in_template_literal = false;
            } else if c == b'$' && bytes.get(i + 1) == Some(&b'{') {
                template_brace_depth += 1;
                i += 2;
                continue;
            } else if c == b'}' && template_brace_depth > 0 {
                template_brace_depth -= 1;
            }
            i += 1;
            continue;
        }

        match c {
            b'"' | b'\'' => in_string = Some(c),
            b'`' => in_template_literal = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }

    None
}

/// Locate every placeholder in `text`. `\${` is an escaped literal and is skipped.
pub(crate) fn scan_placeholders(text: &str) -> Result<Vec<Placeholder>, ExpressionError> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'$') {
            i += 2;
            continue;
        }
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let (escape, brace) = match (bytes.get(i + 1), bytes.get(i + 2)) {
            (Some(b'{'), _) => (true, i + 1),
            (Some(b'!'), Some(b'{')) => (false, i + 2),
            _ => {
                i += 1;
                continue;
            }
        };
        let end = find_balanced_brace_end(text, brace).ok_or_else(|| ExpressionError {
            message: "Unterminated `${` placeholder".to_string(),
            offset: i,
        })?;
        let code = text[brace + 1..end - 1].trim().to_string();
        if code.is_empty() {
            return Err(ExpressionError {
                message: "Empty `${}` placeholder".to_string(),
                offset: i,
            });
        }
        found.push(Placeholder {
            start: i,
            end,
            code,
            escape,
        });
        i = end;
    }

    Ok(found)
}

pub(crate) fn unescape_static(text: &str) -> String {
    text.replace("\\${", "${").replace("\\$!{", "$!{")
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPRESSION FRAGMENT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Segment {
    Static { value: String },
    Code { code: String, escape: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    raw: String,
    segments: Vec<Segment>,
}

impl Expression {
    /// Parse an attribute value. Fails if a placeholder is unbalanced or its
    /// code is not a JavaScript expression.
    pub fn parse(raw: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for placeholder in scan_placeholders(raw)? {
            if placeholder.start > last {
                segments.push(Segment::Static {
                    value: unescape_static(&raw[last..placeholder.start]),
                });
            }
            validate_code(&placeholder.code).map_err(|message| ExpressionError {
                message,
                offset: placeholder.start,
            })?;
            segments.push(Segment::Code {
                code: placeholder.code,
                escape: placeholder.escape,
            });
            last = placeholder.end;
        }
        if last < raw.len() {
            segments.push(Segment::Static {
                value: unescape_static(&raw[last..]),
            });
        }

        Ok(Expression {
            raw: raw.to_string(),
            segments,
        })
    }

    /// A value with no placeholders, taken verbatim.
    pub fn literal(value: &str) -> Self {
        let segments = if value.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Static {
                value: value.to_string(),
            }]
        };
        Expression {
            raw: value.to_string(),
            segments,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Static { .. }))
    }

    pub fn static_value(&self) -> Option<String> {
        if !self.is_static() {
            return None;
        }
        Some(
            self.segments
                .iter()
                .map(|s| match s {
                    Segment::Static { value } => value.as_str(),
                    Segment::Code { .. } => "",
                })
                .collect(),
        )
    }

    /// Interpret the value as code, for attributes such as `test="data.ok"`
    /// that are JavaScript by definition. `test="${data.ok}"` is accepted too.
    pub fn as_code(&self) -> String {
        match self.segments.as_slice() {
            [Segment::Code { code, .. }] => code.clone(),
            _ => self.raw.trim().to_string(),
        }
    }

    /// JavaScript expression producing this value at render time. `resolve`
    /// rewrites each code segment (scope renames).
    pub fn to_js(&self, resolve: &dyn Fn(&str) -> String) -> String {
        match self.segments.as_slice() {
            [] => "\"\"".to_string(),
            [Segment::Code { code, .. }] => resolve(code),
            segments => segments
                .iter()
                .map(|s| match s {
                    Segment::Static { value } => js_string(value),
                    Segment::Code { code, .. } => format!("({})", resolve(code)),
                })
                .collect::<Vec<_>>()
                .join(" + "),
        }
    }
}

/// JavaScript string literal for `value`.
pub fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// CODE VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

fn source_type() -> SourceType {
    SourceType::default().with_module(true)
}

/// Check that `code` parses as a single JavaScript expression.
pub fn validate_code(code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("Expected an expression".to_string());
    }
    let allocator = Allocator::default();
    match Parser::new(&allocator, code, source_type()).parse_expression() {
        Ok(_) => Ok(()),
        Err(errors) => Err(match errors.first() {
            Some(first) => format!("Invalid expression `{}`: {}", code, first),
            None => format!("Invalid expression `{}`", code),
        }),
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIER RENAMING
// ═══════════════════════════════════════════════════════════════════════════════

struct BindingCollector<'s> {
    symbols: &'s mut HashSet<String>,
}

impl<'a, 's> Visit<'a> for BindingCollector<'s> {
    fn visit_binding_identifier(&mut self, ident: &BindingIdentifier<'a>) {
        self.symbols.insert(ident.name.to_string());
    }
}

struct ReferenceRenamer<'r> {
    renames: &'r BTreeMap<String, String>,
    shadowed: Vec<HashSet<String>>,
    replacements: Vec<(u32, u32, String)>,
}

impl<'r> ReferenceRenamer<'r> {
    fn target(&self, name: &str) -> Option<&'r String> {
        if self.shadowed.iter().any(|names| names.contains(name)) {
            return None;
        }
        self.renames.get(name)
    }

    fn params_scope(&mut self, params: &FormalParameters<'_>) {
        let mut names = HashSet::new();
        BindingCollector {
            symbols: &mut names,
        }
        .visit_formal_parameters(params);
        self.shadowed.push(names);
    }
}

impl<'a, 'r> Visit<'a> for ReferenceRenamer<'r> {
    fn visit_identifier_reference(&mut self, ident: &IdentifierReference<'a>) {
        if let Some(new_name) = self.target(ident.name.as_str()) {
            self.replacements
                .push((ident.span.start, ident.span.end, new_name.clone()));
        }
    }

    fn visit_object_property(&mut self, prop: &ObjectProperty<'a>) {
        // `{ item }` must keep its key when `item` is renamed.
        if prop.shorthand {
            if let JsExpression::Identifier(ident) = &prop.value {
                if let Some(new_name) = self.target(ident.name.as_str()) {
                    self.replacements.push((
                        prop.span.start,
                        prop.span.end,
                        format!("{}: {}", ident.name, new_name),
                    ));
                    return;
                }
            }
        }
        walk::walk_object_property(self, prop);
    }

    fn visit_arrow_function_expression(&mut self, func: &ArrowFunctionExpression<'a>) {
        self.params_scope(&func.params);
        walk::walk_arrow_function_expression(self, func);
        self.shadowed.pop();
    }

    fn visit_function(&mut self, func: &Function<'a>, flags: ScopeFlags) {
        self.params_scope(&func.params);
        walk::walk_function(self, func, flags);
        self.shadowed.pop();
    }
}

/// Rewrite free references in `code` according to `renames`. Bindings
/// introduced inside the expression (arrow/function parameters) shadow the
/// renames. Code that fails to parse is returned unchanged.
pub fn rename_identifiers(code: &str, renames: &BTreeMap<String, String>) -> String {
    if renames.is_empty() {
        return code.to_string();
    }

    let allocator = Allocator::default();
    let expr = match Parser::new(&allocator, code, source_type()).parse_expression() {
        Ok(expr) => expr,
        Err(_) => return code.to_string(),
    };

    let mut renamer = ReferenceRenamer {
        renames,
        shadowed: Vec::new(),
        replacements: Vec::new(),
    };
    renamer.visit_expression(&expr);

    let mut replacements = renamer.replacements;
    replacements.sort_by(|a, b| b.0.cmp(&a.0));

    let mut result = code.to_string();
    for (start, end, text) in replacements {
        result.replace_range(start as usize..end as usize, &text);
    }
    result
}

//! Core taglib: conditionals, loops, emitted comments and the legacy `c-*`
//! aliases. Registered by [`TaglibLookup::with_core`](crate::taglib::TaglibLookup::with_core).

use lazy_static::lazy_static;
use regex::Regex;

use crate::ast::{NodeId, NodeKind};
use crate::compiler::CompileContext;
use crate::error::{CompilerError, ERR_INVALID_ATTRIBUTE, ERR_INVALID_NESTING, WARN_DEPRECATED_TAG};
use crate::taglib::{
    transform_fn, MergeRule, NestedTagPolicy, Taglib, TaglibEntry, TransformResult,
};

lazy_static! {
    /// `item in list` or `(item, i) in list`.
    static ref LOOP_RE: Regex = Regex::new(
        r"(?s)^\s*(?:\(\s*([A-Za-z_$][\w$]*)\s*,\s*([A-Za-z_$][\w$]*)\s*\)|([A-Za-z_$][\w$]*))\s+in\s+(\S.*?)\s*$"
    )
    .unwrap();
}

pub const TAGLIB_ID: &str = "core";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSpec {
    pub item: String,
    pub index: Option<String>,
    pub source: String,
}

/// Parse a loop header such as `color in data.colors`.
pub fn parse_loop(header: &str) -> Option<LoopSpec> {
    let caps = LOOP_RE.captures(header)?;
    let (item, index) = match (caps.get(1), caps.get(2), caps.get(3)) {
        (Some(item), Some(index), _) => (item.as_str(), Some(index.as_str().to_string())),
        (_, _, Some(item)) => (item.as_str(), None),
        _ => return None,
    };
    Some(LoopSpec {
        item: item.to_string(),
        index,
        source: caps.get(4)?.as_str().to_string(),
    })
}

pub fn taglib() -> Taglib {
    let branches = ["else-if", "else", "c-else-if", "c-else"];
    let mut conditional = TaglibEntry::new("if").transform(transform_fn("if", lower_if));
    for tag in branches {
        conditional = conditional.merge(tag, MergeRule::Branch);
    }

    let mut taglib = Taglib::new(TAGLIB_ID)
        .entry(conditional)
        .entry(TaglibEntry::new("else-if").transform(transform_fn("orphan-branch", orphan_branch)))
        .entry(TaglibEntry::new("else").transform(transform_fn("orphan-branch", orphan_branch)))
        .entry(TaglibEntry::new("for").transform(transform_fn("for", lower_for)))
        .entry(
            TaglibEntry::new("html-comment")
                .preserve_whitespace()
                .transform(transform_fn("html-comment", lower_html_comment)),
        )
        .global_transform(transform_fn("attribute-directives", attribute_directives));

    for (legacy, modern) in [
        ("c-if", "if"),
        ("c-else-if", "else-if"),
        ("c-else", "else"),
        ("c-for", "for"),
    ] {
        taglib = taglib.entry(
            TaglibEntry::new(legacy)
                .deprecated(&format!("use <{}> instead", modern))
                .transform(transform_fn("rename-legacy", move |node, ctx| {
                    ctx.builder.set_kind(
                        node,
                        NodeKind::Element {
                            tag: modern.to_string(),
                        },
                    )?;
                    Ok(TransformResult::Changed)
                })),
        );
    }
    taglib
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn invalid_attribute(ctx: &CompileContext, node: NodeId, message: String) -> CompilerError {
    CompilerError::InvalidAttribute(ctx.error_at(node, ERR_INVALID_ATTRIBUTE, message))
}

fn invalid_nesting(ctx: &CompileContext, node: NodeId, message: String) -> CompilerError {
    CompilerError::InvalidNesting(ctx.error_at(node, ERR_INVALID_NESTING, message))
}

/// Control tags are replaced by new nodes, so an attribute they do not
/// consume would be lost.
fn only_attributes(
    ctx: &CompileContext,
    node: NodeId,
    allowed: &[&str],
) -> Result<(), CompilerError> {
    let n = ctx.builder.node(node);
    match n
        .attributes()
        .iter()
        .find(|attr| !allowed.contains(&attr.name.as_str()))
    {
        Some(attr) => Err(invalid_attribute(
            ctx,
            node,
            format!(
                "{} does not accept the '{}' attribute",
                n.describe(),
                attr.name
            ),
        )),
        None => Ok(()),
    }
}

/// A detached `Conditional` holding one `Branch` for `test`, positioned at
/// `node`. Returns both so callers can fill the branch.
fn conditional_for(
    ctx: &mut CompileContext,
    node: NodeId,
    test: String,
) -> Result<(NodeId, NodeId), CompilerError> {
    let location = ctx.builder.node(node).location();
    let branch = ctx.builder.create_node_at(
        location,
        NodeKind::Branch { test: Some(test) },
        vec![],
        vec![],
    )?;
    let conditional =
        ctx.builder
            .create_node_at(location, NodeKind::Conditional, vec![], vec![branch])?;
    Ok((conditional, branch))
}

fn required_code(
    ctx: &CompileContext,
    node: NodeId,
    name: &str,
) -> Result<String, CompilerError> {
    let tag = ctx.builder.node(node).describe();
    match ctx.builder.attribute(node, name) {
        Some(attr) if !attr.value.as_code().is_empty() => Ok(attr.value.as_code()),
        _ => Err(invalid_attribute(
            ctx,
            node,
            format!("{} requires a '{}' attribute", tag, name),
        )),
    }
}

fn move_children(ctx: &mut CompileContext, from: NodeId, to: NodeId) -> Result<(), CompilerError> {
    for child in ctx.builder.take_children(from) {
        ctx.builder.append_child(to, child)?;
    }
    Ok(())
}

/// Swap `node` for `replacement` in the parent's child list.
fn replace(
    ctx: &mut CompileContext,
    node: NodeId,
    replacement: NodeId,
) -> Result<TransformResult, CompilerError> {
    match ctx.builder.parent(node) {
        Some(parent) => {
            ctx.builder.replace_child(parent, node, replacement)?;
            Ok(TransformResult::Replaced(replacement))
        }
        None => Err(ctx
            .builder
            .detached_error(node, format!("{} has no parent to replace it in", node))),
    }
}

fn tag_of(ctx: &CompileContext, node: NodeId) -> Option<String> {
    match ctx.builder.kind(node) {
        NodeKind::Element { tag } => Some(tag.clone()),
        _ => None,
    }
}

fn is_branch(ctx: &CompileContext, policy: &NestedTagPolicy, node: NodeId) -> bool {
    match tag_of(ctx, node) {
        Some(tag) => policy.rule_for(&tag) == MergeRule::Branch,
        None => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONDITIONALS
// ═══════════════════════════════════════════════════════════════════════════════

/// Turn `<if>` plus its `<else-if>`/`<else>` (nested or following) into a
/// `Conditional` of `Branch` nodes.
fn lower_if(node: NodeId, ctx: &mut CompileContext) -> Result<TransformResult, CompilerError> {
    let tag = match tag_of(ctx, node) {
        Some(tag) => tag,
        None => return Ok(TransformResult::Unchanged),
    };
    only_attributes(ctx, node, &["test", "for"])?;
    let test = required_code(ctx, node, "test")?;
    let policy = ctx
        .entry(&tag)
        .map(|entry| entry.nested().clone())
        .unwrap_or_default();
    let is_branch_tag = |ctx: &CompileContext, id: NodeId| is_branch(ctx, &policy, id);

    let (conditional, first) = conditional_for(ctx, node, test)?;

    // Nested branch tags, then branch tags following the `<if>`.
    let mut pending = Vec::new();
    for child in ctx.builder.take_children(node) {
        if is_branch_tag(&*ctx, child) {
            pending.push(child);
        } else {
            ctx.builder.append_child(first, child)?;
        }
    }
    let mut cursor = ctx.builder.next_sibling(node);
    while let Some(sibling) = cursor {
        let next = ctx.builder.next_sibling(sibling);
        if ctx.builder.node(sibling).is_blank_text() {
            if next.map(|n| is_branch_tag(&*ctx, n)).unwrap_or(false) {
                ctx.builder.detach(sibling)?;
                cursor = next;
                continue;
            }
            break;
        }
        if !is_branch_tag(&*ctx, sibling) {
            break;
        }
        ctx.builder.detach(sibling)?;
        pending.push(sibling);
        cursor = next;
    }

    let mut closed = false;
    for branch_tag in pending {
        let name = tag_of(ctx, branch_tag).unwrap_or_default();
        if closed {
            return Err(invalid_nesting(
                ctx,
                branch_tag,
                format!("<{}> cannot follow <else>", name),
            ));
        }
        if let Some(message) = ctx.entry(&name).and_then(|e| e.deprecation()).map(str::to_string) {
            ctx.warn(
                branch_tag,
                WARN_DEPRECATED_TAG,
                format!("<{}> is deprecated: {}", name, message),
            );
        }
        let chained = name.ends_with("else-if");
        let allowed: &[&str] = if chained { &["test"] } else { &[] };
        only_attributes(ctx, branch_tag, allowed)?;
        let test = if chained {
            Some(required_code(ctx, branch_tag, "test")?)
        } else {
            closed = true;
            None
        };
        let location = ctx.builder.node(branch_tag).location();
        let branch =
            ctx.builder
                .create_node_at(location, NodeKind::Branch { test }, vec![], vec![])?;
        move_children(ctx, branch_tag, branch)?;
        ctx.builder.append_child(conditional, branch)?;
    }

    // `<if for="x in xs">` repeats the whole chain; the loop is outermost.
    match ctx.builder.attribute(node, "for").map(|a| a.value.as_code()) {
        Some(header) => {
            let iteration = iteration_for(ctx, node, &header)?;
            let result = replace(ctx, node, iteration)?;
            ctx.builder.append_child(iteration, conditional)?;
            Ok(result)
        }
        None => replace(ctx, node, conditional),
    }
}

/// Branch tags are consumed by the preceding `<if>`; reaching one means it
/// has nothing to attach to.
fn orphan_branch(node: NodeId, ctx: &mut CompileContext) -> Result<TransformResult, CompilerError> {
    let label = ctx.builder.node(node).describe();
    Err(invalid_nesting(
        ctx,
        node,
        format!("{} must follow an <if> or <else-if>", label),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOOPS
// ═══════════════════════════════════════════════════════════════════════════════

fn iteration_for(
    ctx: &mut CompileContext,
    node: NodeId,
    header: &str,
) -> Result<NodeId, CompilerError> {
    let parsed = parse_loop(header).ok_or_else(|| {
        invalid_attribute(
            ctx,
            node,
            format!("Invalid loop '{}': expected `item in list`", header),
        )
    })?;
    let location = ctx.builder.node(node).location();
    ctx.builder.create_node_at(
        location,
        NodeKind::Iteration {
            item: parsed.item,
            index: parsed.index,
            source: parsed.source,
        },
        vec![],
        vec![],
    )
}

fn lower_for(node: NodeId, ctx: &mut CompileContext) -> Result<TransformResult, CompilerError> {
    if tag_of(ctx, node).is_none() {
        return Ok(TransformResult::Unchanged);
    }
    only_attributes(ctx, node, &["each", "if"])?;
    let header = required_code(ctx, node, "each")?;
    let iteration = iteration_for(ctx, node, &header)?;

    // `<for each="x in xs" if="x.ok">` tests each item.
    if ctx.builder.attribute(node, "if").is_some() {
        let test = required_code(ctx, node, "if")?;
        let (conditional, branch) = conditional_for(ctx, node, test)?;
        move_children(ctx, node, branch)?;
        ctx.builder.append_child(iteration, conditional)?;
    } else {
        move_children(ctx, node, iteration)?;
    }
    replace(ctx, node, iteration)
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMMENTS
// ═══════════════════════════════════════════════════════════════════════════════

fn lower_html_comment(
    node: NodeId,
    ctx: &mut CompileContext,
) -> Result<TransformResult, CompilerError> {
    if tag_of(ctx, node).is_none() {
        return Ok(TransformResult::Unchanged);
    }
    only_attributes(ctx, node, &[])?;
    let mut value = String::new();
    for child in ctx.builder.children(node) {
        match ctx.builder.kind(*child) {
            NodeKind::Text { value: text } => value.push_str(text),
            _ => {
                return Err(invalid_nesting(
                    ctx,
                    *child,
                    "<html-comment> may only contain text".to_string(),
                ))
            }
        }
    }
    let location = ctx.builder.node(node).location();
    let comment = ctx.builder.create_node_at(
        location,
        NodeKind::Comment { value, emit: true },
        vec![],
        vec![],
    )?;
    replace(ctx, node, comment)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATTRIBUTE DIRECTIVES
// ═══════════════════════════════════════════════════════════════════════════════

/// `for="item in list"` and `if="cond"` on any tag wrap it in the matching
/// construct, `for` outermost. A `for` value that is not a loop header (as on
/// `<label for="email">`) is left alone.
fn attribute_directives(
    node: NodeId,
    ctx: &mut CompileContext,
) -> Result<TransformResult, CompilerError> {
    if ctx.builder.parent(node).is_none() {
        return Ok(TransformResult::Unchanged);
    }

    let header = ctx
        .builder
        .attribute(node, "for")
        .filter(|attr| attr.value.is_static())
        .map(|attr| attr.value.as_code())
        .filter(|header| parse_loop(header).is_some());
    if let Some(header) = header {
        ctx.builder.remove_attribute(node, "for");
        let iteration = iteration_for(ctx, node, &header)?;
        return wrap(ctx, node, iteration);
    }

    if let Some(test) = ctx.builder.attribute(node, "if").map(|a| a.value.as_code()) {
        if test.is_empty() {
            return Err(invalid_attribute(
                ctx,
                node,
                "The 'if' attribute needs a condition".to_string(),
            ));
        }
        ctx.builder.remove_attribute(node, "if");
        let (conditional, _) = conditional_for(ctx, node, test)?;
        return wrap(ctx, node, conditional);
    }

    Ok(TransformResult::Unchanged)
}

/// Put `wrapper` where `node` was and move `node` to the wrapper's innermost
/// container.
fn wrap(
    ctx: &mut CompileContext,
    node: NodeId,
    wrapper: NodeId,
) -> Result<TransformResult, CompilerError> {
    let result = replace(ctx, node, wrapper)?;
    let mut inner = wrapper;
    while let Some(child) = ctx.builder.children(inner).last().copied() {
        inner = child;
    }
    ctx.builder.append_child(inner, node)?;
    Ok(result)
}

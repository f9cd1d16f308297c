//! Taglib lookup: tag semantics expressed as data.
//!
//! A [`Taglib`] maps tag names to [`TaglibEntry`] values holding ordered
//! [`Transform`]s and a nesting policy. A [`TaglibLookup`] stacks taglibs,
//! optionally scoped to a directory, and answers "which entry applies to this
//! tag in this file". The lookup is read-only during compilation and can be
//! shared between threads.

use lazy_static::lazy_static;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ast::{NodeId, NodeKind};
use crate::compiler::CompileContext;
use crate::error::CompilerError;

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFORM CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformPhase {
    /// Runs before the node's children are walked.
    Enter,
    /// Runs after every child has settled.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformResult {
    Unchanged,
    /// The node was edited in place; its transforms run again.
    Changed,
    /// The node was swapped for another node, which is entered in its place.
    Replaced(NodeId),
    /// The node and its subtree were detached.
    Removed,
}

pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    fn phase(&self) -> TransformPhase {
        TransformPhase::Enter
    }

    fn apply(&self, node: NodeId, ctx: &mut CompileContext)
        -> Result<TransformResult, CompilerError>;
}

type TransformFn =
    dyn Fn(NodeId, &mut CompileContext) -> Result<TransformResult, CompilerError> + Send + Sync;

/// Closure-backed transform.
pub struct FnTransform {
    name: String,
    phase: TransformPhase,
    f: Box<TransformFn>,
}

impl Transform for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> TransformPhase {
        self.phase
    }

    fn apply(
        &self,
        node: NodeId,
        ctx: &mut CompileContext,
    ) -> Result<TransformResult, CompilerError> {
        (self.f)(node, ctx)
    }
}

pub fn transform_fn<F>(name: &str, f: F) -> Arc<dyn Transform>
where
    F: Fn(NodeId, &mut CompileContext) -> Result<TransformResult, CompilerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnTransform {
        name: name.to_string(),
        phase: TransformPhase::Enter,
        f: Box::new(f),
    })
}

pub fn exit_transform_fn<F>(name: &str, f: F) -> Arc<dyn Transform>
where
    F: Fn(NodeId, &mut CompileContext) -> Result<TransformResult, CompilerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnTransform {
        name: name.to_string(),
        phase: TransformPhase::Exit,
        f: Box::new(f),
    })
}

/// Rewrites an element into a [`NodeKind::CustomTag`] bound to a renderer.
struct BindRenderer {
    renderer: String,
}

impl Transform for BindRenderer {
    fn name(&self) -> &str {
        "bind-renderer"
    }

    fn apply(
        &self,
        node: NodeId,
        ctx: &mut CompileContext,
    ) -> Result<TransformResult, CompilerError> {
        let tag = match ctx.builder.kind(node) {
            NodeKind::Element { tag } => tag.clone(),
            _ => return Ok(TransformResult::Unchanged),
        };
        ctx.builder.set_kind(
            node,
            NodeKind::CustomTag {
                name: tag,
                renderer: self.renderer.clone(),
            },
        )?;
        Ok(TransformResult::Changed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// The nested tag stays an ordinary child.
    Keep,
    /// The nested (or directly following) tag becomes another branch of the
    /// parent's conditional, e.g. `else` under `if`.
    Branch,
}

#[derive(Debug, Clone, Default)]
pub struct NestedTagPolicy {
    /// `None` allows any child tag.
    pub allowed_children: Option<BTreeSet<String>>,
    pub merge: BTreeMap<String, MergeRule>,
}

impl NestedTagPolicy {
    pub fn allows(&self, child_tag: &str) -> bool {
        match &self.allowed_children {
            None => true,
            Some(allowed) => allowed.contains(child_tag) || self.merge.contains_key(child_tag),
        }
    }

    pub fn rule_for(&self, child_tag: &str) -> MergeRule {
        self.merge.get(child_tag).copied().unwrap_or(MergeRule::Keep)
    }
}

#[derive(Clone)]
pub struct TaglibEntry {
    name: String,
    transforms: Vec<Arc<dyn Transform>>,
    binder: Option<Arc<dyn Transform>>,
    renderer: Option<String>,
    deprecated: Option<String>,
    preserve_whitespace: bool,
    nested: NestedTagPolicy,
}

impl fmt::Debug for TaglibEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaglibEntry")
            .field("name", &self.name)
            .field(
                "transforms",
                &self.transforms().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("renderer", &self.renderer)
            .field("deprecated", &self.deprecated)
            .field("preserve_whitespace", &self.preserve_whitespace)
            .field("nested", &self.nested)
            .finish()
    }
}

impl TaglibEntry {
    pub fn new(name: &str) -> Self {
        TaglibEntry {
            name: name.to_string(),
            transforms: Vec::new(),
            binder: None,
            renderer: None,
            deprecated: None,
            preserve_whitespace: false,
            nested: NestedTagPolicy::default(),
        }
    }

    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Bind the tag to a runtime handler module.
    pub fn renderer(mut self, path: &str) -> Self {
        self.renderer = Some(path.to_string());
        self.binder = Some(Arc::new(BindRenderer {
            renderer: path.to_string(),
        }));
        self
    }

    pub fn deprecated(mut self, message: &str) -> Self {
        self.deprecated = Some(message.to_string());
        self
    }

    pub fn preserve_whitespace(mut self) -> Self {
        self.preserve_whitespace = true;
        self
    }

    pub fn allow_children<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nested
            .allowed_children
            .get_or_insert_with(BTreeSet::new)
            .extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn merge(mut self, child_tag: &str, rule: MergeRule) -> Self {
        self.nested.merge.insert(child_tag.to_string(), rule);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared transforms in order, followed by renderer binding.
    pub fn transforms(&self) -> impl Iterator<Item = &Arc<dyn Transform>> {
        self.transforms.iter().chain(self.binder.iter())
    }

    pub fn renderer_path(&self) -> Option<&str> {
        self.renderer.as_deref()
    }

    pub fn deprecation(&self) -> Option<&str> {
        self.deprecated.as_deref()
    }

    pub fn preserves_whitespace(&self) -> bool {
        self.preserve_whitespace
    }

    pub fn nested(&self) -> &NestedTagPolicy {
        &self.nested
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TAGLIB
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct Taglib {
    id: String,
    entries: BTreeMap<String, TaglibEntry>,
    global_transforms: Vec<Arc<dyn Transform>>,
}

impl fmt::Debug for Taglib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Taglib")
            .field("id", &self.id)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field(
                "global_transforms",
                &self
                    .global_transforms
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Taglib {
    pub fn new(id: &str) -> Self {
        Taglib {
            id: id.to_string(),
            entries: BTreeMap::new(),
            global_transforms: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry(mut self, entry: TaglibEntry) -> Self {
        self.entries.insert(entry.name.clone(), entry);
        self
    }

    /// Transform applied to every element and custom tag.
    pub fn global_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.global_transforms.push(transform);
        self
    }

    pub fn get(&self, tag: &str) -> Option<&TaglibEntry> {
        self.entries.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOOKUP
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct ScopedTaglib {
    scope: Option<PathBuf>,
    taglib: Taglib,
}

impl ScopedTaglib {
    fn depth(&self) -> usize {
        self.scope
            .as_ref()
            .map(|dir| dir.components().count())
            .unwrap_or(0)
    }

    fn applies_to(&self, file_path: &Path) -> bool {
        match &self.scope {
            None => true,
            Some(dir) => file_path.starts_with(dir),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaglibLookup {
    taglibs: Vec<ScopedTaglib>,
}

impl TaglibLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lookup with the built-in core taglib registered.
    pub fn with_core() -> Self {
        let mut lookup = Self::new();
        lookup.register(crate::taglibs::core::taglib());
        lookup
    }

    /// Register a taglib visible to every template.
    pub fn register(&mut self, taglib: Taglib) {
        self.taglibs.push(ScopedTaglib {
            scope: None,
            taglib,
        });
    }

    /// Register a taglib visible to templates under `dir`.
    pub fn register_scoped(&mut self, dir: impl Into<PathBuf>, taglib: Taglib) {
        self.taglibs.push(ScopedTaglib {
            scope: Some(dir.into()),
            taglib,
        });
    }

    /// Applicable taglibs, most specific first: deeper scopes before
    /// shallower ones, later registrations before earlier ones.
    fn applicable(&self, file_path: &str) -> Vec<&ScopedTaglib> {
        let path = Path::new(file_path);
        let mut found: Vec<(usize, usize, &ScopedTaglib)> = self
            .taglibs
            .iter()
            .enumerate()
            .filter(|(_, t)| t.applies_to(path))
            .map(|(index, t)| (t.depth(), index, t))
            .collect();
        found.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        found.into_iter().map(|(_, _, t)| t).collect()
    }

    pub fn lookup(&self, tag: &str, file_path: &str) -> Option<&TaglibEntry> {
        self.applicable(file_path)
            .into_iter()
            .find_map(|scoped| scoped.taglib.get(tag))
    }

    /// Global transforms for a file, least specific taglib first so the order
    /// follows registration.
    pub fn global_transforms(&self, file_path: &str) -> Vec<Arc<dyn Transform>> {
        let mut applicable = self.applicable(file_path);
        applicable.reverse();
        applicable
            .into_iter()
            .flat_map(|scoped| scoped.taglib.global_transforms.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.taglibs.is_empty()
    }

    /// Stable description of every registration: scopes, taglib ids, entries
    /// with their transform names and renderers, and global transforms.
    /// Transform bodies are not observable, so taglibs that change behaviour
    /// must change a name, renderer or id to invalidate cached output.
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        for scoped in &self.taglibs {
            let taglib = &scoped.taglib;
            out.push_str(&format!("{:?}|{}|", scoped.scope, taglib.id));
            for entry in taglib.entries.values() {
                out.push_str(&format!("{:?};", entry));
            }
            for transform in &taglib.global_transforms {
                out.push_str(&format!("*{}:{:?};", transform.name(), transform.phase()));
            }
            out.push('\n');
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STANDARD MARKUP TAGS
// ═══════════════════════════════════════════════════════════════════════════════

lazy_static! {
    static ref STANDARD_TAGS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        for tag in [
            "a", "abbr", "address", "area", "article", "aside", "audio", "b", "base", "bdi",
            "bdo", "blockquote", "body", "br", "button", "canvas", "caption", "cite", "code",
            "col", "colgroup", "data", "datalist", "dd", "del", "details", "dfn", "dialog",
            "div", "dl", "dt", "em", "embed", "fieldset", "figcaption", "figure", "footer",
            "form", "h1", "h2", "h3", "h4", "h5", "h6", "head", "header", "hgroup", "hr",
            "html", "i", "iframe", "img", "input", "ins", "kbd", "label", "legend", "li",
            "link", "main", "map", "mark", "menu", "meta", "meter", "nav", "noscript",
            "object", "ol", "optgroup", "option", "output", "p", "param", "picture", "pre",
            "progress", "q", "rp", "rt", "ruby", "s", "samp", "script", "search", "section",
            "select", "slot", "small", "source", "span", "strong", "style", "sub", "summary",
            "sup", "table", "tbody", "td", "template", "textarea", "tfoot", "th", "thead",
            "time", "title", "tr", "track", "u", "ul", "var", "video", "wbr",
            // SVG
            "svg", "path", "circle", "ellipse", "line", "polyline", "polygon", "rect", "g",
            "defs", "use", "symbol", "clippath", "mask", "pattern", "marker",
            "lineargradient", "radialgradient", "stop", "filter", "foreignobject", "image",
            "switch", "text", "tspan", "textpath", "desc", "metadata", "view", "animate",
            "animatemotion", "animatetransform", "set", "mpath",
            // MathML root
            "math",
        ] {
            s.insert(tag);
        }
        s
    };
}

/// Whether `tag` is plain HTML/SVG markup that needs no taglib entry.
pub fn is_standard_tag(tag: &str) -> bool {
    STANDARD_TAGS.contains(tag.to_ascii_lowercase().as_str())
}

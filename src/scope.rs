//! Scope stack for the code generator.
//!
//! Each frame maps template-level binding names to the identifiers emitted
//! for them. A binding that collides with a name visible in an enclosing
//! frame (or a reserved runtime name) is renamed `name_1`, `name_2`, … and
//! every expression resolved inside the frame is rewritten to match.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::expression::rename_identifiers;

lazy_static! {
    /// Identifiers the generated module itself binds.
    pub static ref RESERVED_NAMES: HashSet<&'static str> = {
        let mut s = HashSet::new();
        // Module wrapper
        s.insert("module");
        s.insert("require");
        s.insert("create");
        s.insert("render");
        s.insert("__helpers");

        // Runtime helpers
        s.insert("str");
        s.insert("escapeXml");
        s.insert("attr");
        s.insert("loadTag");

        // Render arguments
        s.insert("data");
        s.insert("out");
        s
    };
}

/// A hoisted module-level declaration such as a tag handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub init: String,
}

#[derive(Debug, Default)]
struct Frame {
    /// Template name → emitted name.
    bindings: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ScopeStack {
    frames: Vec<Frame>,
    hoisted: Vec<Declaration>,
    /// Every name emitted by `declare`. Loop bindings are `var`s of the
    /// render function, so they stay live after their frame closes.
    emitted: HashSet<String>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            frames: vec![Frame::default()],
            hoisted: Vec::new(),
            emitted: HashSet::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Close the innermost frame. The root frame is never popped.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    fn is_taken(&self, name: &str) -> bool {
        RESERVED_NAMES.contains(name)
            || self.hoisted.iter().any(|d| d.name == name)
            || self
                .frames
                .iter()
                .any(|f| f.bindings.contains_key(name) || f.bindings.values().any(|v| v == name))
    }

    fn unique(&self, name: &str, taken: impl Fn(&str) -> bool) -> String {
        if !taken(name) {
            return name.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", name, n);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Declare `name` in the innermost frame and return the identifier to
    /// emit for it.
    pub fn declare(&mut self, name: &str) -> String {
        let emitted = self.unique(name, |n| self.is_taken(n));
        if let Some(frame) = self.frames.last_mut() {
            frame.bindings.insert(name.to_string(), emitted.clone());
        }
        self.emitted.insert(emitted.clone());
        emitted
    }

    /// Hoist a module-level declaration. Declarations with the same
    /// initializer share one identifier, which never matches a name declared
    /// anywhere in the render function.
    pub fn hoist(&mut self, hint: &str, init: String) -> String {
        if let Some(existing) = self.hoisted.iter().find(|d| d.init == init) {
            return existing.name.clone();
        }
        let name = self.unique(hint, |n| self.is_taken(n) || self.emitted.contains(n));
        self.hoisted.push(Declaration {
            name: name.clone(),
            init,
        });
        name
    }

    pub fn hoisted(&self) -> &[Declaration] {
        &self.hoisted
    }

    /// Renames in effect for the innermost frame.
    pub fn renames(&self) -> BTreeMap<String, String> {
        let mut renames = BTreeMap::new();
        for frame in &self.frames {
            for (name, emitted) in &frame.bindings {
                if name == emitted {
                    renames.remove(name);
                } else {
                    renames.insert(name.clone(), emitted.clone());
                }
            }
        }
        renames
    }

    /// Rewrite `code` so it refers to the emitted names of renamed bindings.
    pub fn resolve(&self, code: &str) -> String {
        rename_identifiers(code, &self.renames())
    }
}

/// Turn a tag name into an identifier hint: `fancy-box` → `fancy_box`.
pub fn identifier_hint(name: &str) -> String {
    let mut hint: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if hint.starts_with(|c: char| c.is_ascii_digit()) || hint.is_empty() {
        hint.insert(0, '_');
    }
    hint
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_names_are_kept() {
        let mut scope = ScopeStack::new();
        assert_eq!(scope.declare("item"), "item");
        assert!(scope.renames().is_empty());
        assert_eq!(scope.resolve("item.name"), "item.name");
    }

    #[test]
    fn test_shadowing_is_renamed_deterministically() {
        let mut scope = ScopeStack::new();
        scope.push();
        assert_eq!(scope.declare("item"), "item");
        scope.push();
        assert_eq!(scope.declare("item"), "item_1");
        assert_eq!(scope.resolve("item.children"), "item_1.children");
        scope.push();
        assert_eq!(scope.declare("item"), "item_2");
        scope.pop();
        scope.pop();
        assert_eq!(scope.resolve("item.children"), "item.children");
    }

    #[test]
    fn test_reserved_names_are_renamed() {
        let mut scope = ScopeStack::new();
        scope.push();
        assert_eq!(scope.declare("data"), "data_1");
        assert_eq!(scope.resolve("data.name"), "data_1.name");
    }

    #[test]
    fn test_hoist_dedupes_by_initializer() {
        let mut scope = ScopeStack::new();
        let a = scope.hoist("card_tag", "loadTag(require(\"./card\"))".to_string());
        let b = scope.hoist("card_tag", "loadTag(require(\"./card\"))".to_string());
        let c = scope.hoist("card_tag", "loadTag(require(\"./other/card\"))".to_string());
        assert_eq!(a, "card_tag");
        assert_eq!(a, b);
        assert_eq!(c, "card_tag_1");
        assert_eq!(scope.hoisted().len(), 2);
    }

    #[test]
    fn test_hoist_avoids_closed_loop_bindings() {
        let mut scope = ScopeStack::new();
        scope.push();
        assert_eq!(scope.declare("card_tag"), "card_tag");
        scope.pop();
        let handler = scope.hoist("card_tag", "loadTag(require(\"./card\"))".to_string());
        assert_eq!(handler, "card_tag_1");
    }

    #[test]
    fn test_root_frame_survives_pop() {
        let mut scope = ScopeStack::new();
        scope.pop();
        assert_eq!(scope.depth(), 1);
    }

    #[test]
    fn test_identifier_hint() {
        assert_eq!(identifier_hint("fancy-box"), "fancy_box");
        assert_eq!(identifier_hint("ui:card"), "ui_card");
        assert_eq!(identifier_hint("9lives"), "_9lives");
    }
}

//! Walker: applies taglib transforms to every node until the tree settles.
//!
//! Traversal is depth-first. Each node goes through
//! `Unvisited → Entering → Entered → Exiting → Settled`, or `Failed` when a
//! transform raises an error.
//!
//! 1. **Enter**: the node's entry transforms (then global transforms) run in
//!    declared order. `Changed` restarts the sequence on the same node,
//!    `Replaced` restarts it on the replacement, `Removed` ends the visit.
//!    Every restart counts against `max_passes`.
//! 2. **Children**: visited left to right. Children are picked by state, not
//!    by position, so siblings inserted or removed by a child's transforms are
//!    handled and settled siblings are never revisited.
//! 3. **Exit**: exit-phase transforms run once every child has settled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ast::{NodeId, NodeKind, WalkState};
use crate::compiler::CompileContext;
use crate::error::{
    CompilerError, Diagnostic, ERR_INVALID_NESTING, ERR_TRANSFORM_LOOP, ERR_UNKNOWN_TAG,
    WARN_DEPRECATED_TAG, WARN_UNKNOWN_TAG,
};
use crate::taglib::{is_standard_tag, Transform, TransformPhase, TransformResult};

pub const DEFAULT_MAX_TRANSFORM_PASSES: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub nodes_visited: usize,
    pub transforms_applied: usize,
}

enum Visit {
    Settled,
    Removed,
}

enum Step {
    Stable,
    Changed,
    Replaced(NodeId),
    Removed,
}

pub struct Walker {
    max_passes: usize,
    stats: WalkStats,
    globals: Vec<Arc<dyn Transform>>,
    warned: HashSet<(NodeId, &'static str)>,
    /// Pass count a node starts from. A replaced node that reappears inside
    /// its replacement resumes from its own count, and nodes created by a
    /// transform start from the count of the node they were created for, so
    /// a tag that keeps expanding into fresh copies of itself still hits the
    /// bound.
    carried: HashMap<NodeId, usize>,
}

impl Default for Walker {
    fn default() -> Self {
        Walker::new(DEFAULT_MAX_TRANSFORM_PASSES)
    }
}

impl Walker {
    pub fn new(max_passes: usize) -> Self {
        Walker {
            max_passes,
            stats: WalkStats::default(),
            globals: Vec::new(),
            warned: HashSet::new(),
            carried: HashMap::new(),
        }
    }

    /// Walk the tree under `root` to a fixpoint. Walking an already settled
    /// tree applies no transforms.
    pub fn walk(
        &mut self,
        root: NodeId,
        ctx: &mut CompileContext,
    ) -> Result<WalkStats, CompilerError> {
        self.stats = WalkStats::default();
        self.warned.clear();
        self.carried.clear();
        self.globals = ctx.taglibs.global_transforms(&ctx.file_path);
        reset_states(root, ctx);

        self.visit(root, 0, ctx)?;
        log::debug!(
            "walked {}: {} nodes visited, {} transforms applied",
            ctx.file_path,
            self.stats.nodes_visited,
            self.stats.transforms_applied
        );
        Ok(self.stats)
    }

    fn visit(
        &mut self,
        id: NodeId,
        mut passes: usize,
        ctx: &mut CompileContext,
    ) -> Result<Visit, CompilerError> {
        let mut current = id;
        if let Some(carried) = self.carried.get(&id) {
            passes = passes.max(*carried);
        }
        self.stats.nodes_visited += 1;

        loop {
            ctx.builder.set_state(current, WalkState::Entering);
            if let Err(err) = self.check_tag(current, ctx) {
                ctx.builder.set_state(current, WalkState::Failed);
                return Err(err);
            }
            let arena = ctx.builder.len();
            let next = match self.run_phase(current, TransformPhase::Enter, ctx)? {
                Step::Stable => break,
                Step::Changed => None,
                Step::Replaced(next) => Some(next),
                Step::Removed => return Ok(Visit::Removed),
            };
            passes += 1;
            if passes > self.max_passes {
                return Err(self.loop_error(current, ctx));
            }
            self.inherit_passes(arena, passes, ctx);
            if let Some(next) = next {
                ctx.builder.set_state(current, WalkState::Unvisited);
                self.carried.insert(current, passes);
                current = next;
            }
        }

        ctx.builder.set_state(current, WalkState::Entered);
        self.walk_children(current, ctx)?;

        ctx.builder.set_state(current, WalkState::Exiting);
        loop {
            let arena = ctx.builder.len();
            match self.run_phase(current, TransformPhase::Exit, ctx)? {
                Step::Stable => break,
                Step::Changed => {
                    passes += 1;
                    if passes > self.max_passes {
                        return Err(self.loop_error(current, ctx));
                    }
                    self.inherit_passes(arena, passes, ctx);
                    self.walk_children(current, ctx)?;
                }
                Step::Replaced(next) => {
                    passes += 1;
                    if passes > self.max_passes {
                        return Err(self.loop_error(current, ctx));
                    }
                    self.inherit_passes(arena, passes, ctx);
                    ctx.builder.set_state(current, WalkState::Unvisited);
                    self.carried.insert(current, passes);
                    return self.visit(next, passes, ctx);
                }
                Step::Removed => return Ok(Visit::Removed),
            }
        }

        ctx.builder.set_state(current, WalkState::Settled);
        Ok(Visit::Settled)
    }

    /// Nodes created since the arena held `arena` nodes start at `passes`.
    fn inherit_passes(&mut self, arena: usize, passes: usize, ctx: &CompileContext) {
        for index in arena..ctx.builder.len() {
            let carried = self.carried.entry(NodeId(index as u32)).or_insert(0);
            *carried = (*carried).max(passes);
        }
    }

    fn walk_children(
        &mut self,
        parent: NodeId,
        ctx: &mut CompileContext,
    ) -> Result<(), CompilerError> {
        let mut index = 0;
        while let Some(child) = ctx.builder.children(parent).get(index).copied() {
            if ctx.builder.node(child).state() != WalkState::Unvisited {
                index += 1;
                continue;
            }
            self.visit(child, 0, ctx)?;
        }
        Ok(())
    }

    fn transforms_for(
        &self,
        id: NodeId,
        phase: TransformPhase,
        ctx: &CompileContext,
    ) -> Vec<Arc<dyn Transform>> {
        let tag = match ctx.builder.node(id).tag_name() {
            Some(tag) => tag,
            None => return Vec::new(),
        };
        let mut transforms: Vec<Arc<dyn Transform>> = ctx
            .taglibs
            .lookup(tag, &ctx.file_path)
            .map(|entry| entry.transforms().cloned().collect())
            .unwrap_or_default();
        transforms.extend(self.globals.iter().cloned());
        transforms.retain(|t| t.phase() == phase);
        transforms
    }

    fn run_phase(
        &mut self,
        id: NodeId,
        phase: TransformPhase,
        ctx: &mut CompileContext,
    ) -> Result<Step, CompilerError> {
        for transform in self.transforms_for(id, phase, ctx) {
            let result = match transform.apply(id, ctx) {
                Ok(result) => result,
                Err(err) => {
                    ctx.builder.set_state(id, WalkState::Failed);
                    return Err(err);
                }
            };
            if result != TransformResult::Unchanged {
                self.stats.transforms_applied += 1;
                log::trace!(
                    "{} on {} {}: {:?}",
                    transform.name(),
                    ctx.builder.node(id).describe(),
                    id,
                    result
                );
            }
            match result {
                TransformResult::Unchanged => continue,
                TransformResult::Changed => return Ok(Step::Changed),
                TransformResult::Replaced(next) if next == id => return Ok(Step::Changed),
                TransformResult::Replaced(next) => {
                    if ctx.builder.parent(next).is_none() {
                        ctx.builder.set_state(id, WalkState::Failed);
                        return Err(ctx.builder.detached_error(
                            next,
                            format!(
                                "Transform '{}' replaced {} with a node that is not in the tree",
                                transform.name(),
                                id
                            ),
                        ));
                    }
                    return Ok(Step::Replaced(next));
                }
                TransformResult::Removed => {
                    if ctx.builder.parent(id).is_some() {
                        ctx.builder.set_state(id, WalkState::Failed);
                        return Err(ctx.builder.detached_error(
                            id,
                            format!(
                                "Transform '{}' reported removal but {} is still attached",
                                transform.name(),
                                id
                            ),
                        ));
                    }
                    ctx.builder.set_state(id, WalkState::Settled);
                    return Ok(Step::Removed);
                }
            }
        }
        Ok(Step::Stable)
    }

    /// Unknown tags, deprecations, whitespace markers and nesting rules.
    fn check_tag(&mut self, id: NodeId, ctx: &mut CompileContext) -> Result<(), CompilerError> {
        let node = ctx.builder.node(id);
        let tag = match node.tag_name() {
            Some(tag) => tag.to_string(),
            None => return Ok(()),
        };
        let location = node.location();
        let is_element = matches!(node.kind(), NodeKind::Element { .. });
        let taglibs = Arc::clone(&ctx.taglibs);

        match taglibs.lookup(&tag, &ctx.file_path) {
            Some(entry) => {
                if let Some(message) = entry.deprecation() {
                    if self.warned.insert((id, WARN_DEPRECATED_TAG)) {
                        ctx.diagnostics.push(
                            Diagnostic::warning(
                                WARN_DEPRECATED_TAG,
                                format!("<{}> is deprecated: {}", tag, message),
                                &ctx.file_path,
                                location,
                            )
                            .with_context(format!("<{}>", tag)),
                        );
                    }
                }
                if entry.preserves_whitespace() {
                    ctx.builder.set_preserve_whitespace(id, true);
                }
            }
            None if is_element && !is_standard_tag(&tag) => {
                if !ctx.options.allow_unknown_tags {
                    return Err(CompilerError::UnknownTag(
                        Diagnostic::error(
                            ERR_UNKNOWN_TAG,
                            format!("Unknown tag <{}>", tag),
                            &ctx.file_path,
                            location,
                        )
                        .with_context(format!("<{}>", tag)),
                    ));
                }
                if self.warned.insert((id, WARN_UNKNOWN_TAG)) {
                    ctx.diagnostics.push(Diagnostic::warning(
                        WARN_UNKNOWN_TAG,
                        format!("Unknown tag <{}> passed through as markup", tag),
                        &ctx.file_path,
                        location,
                    ));
                }
            }
            None => {}
        }

        let parent_tag = ctx
            .builder
            .parent(id)
            .and_then(|p| ctx.builder.node(p).tag_name());
        if let Some(parent_tag) = parent_tag {
            if let Some(parent_entry) = taglibs.lookup(parent_tag, &ctx.file_path) {
                if !parent_entry.nested().allows(&tag) {
                    return Err(CompilerError::InvalidNesting(Diagnostic::error(
                        ERR_INVALID_NESTING,
                        format!("<{}> is not allowed inside <{}>", tag, parent_tag),
                        &ctx.file_path,
                        location,
                    )));
                }
            }
        }

        Ok(())
    }

    fn loop_error(&self, id: NodeId, ctx: &mut CompileContext) -> CompilerError {
        ctx.builder.set_state(id, WalkState::Failed);
        let node = ctx.builder.node(id);
        let label = node.describe();
        CompilerError::TransformLoop(
            Diagnostic::error(
                ERR_TRANSFORM_LOOP,
                format!(
                    "Transforms for {} did not settle after {} passes",
                    label, self.max_passes
                ),
                &ctx.file_path,
                node.location(),
            )
            .with_context(label),
        )
    }
}

fn reset_states(root: NodeId, ctx: &mut CompileContext) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        ctx.builder.set_state(id, WalkState::Unvisited);
        stack.extend(ctx.builder.children(id).iter().copied());
    }
}

//! # Markup template compiler
//!
//! Compiles markup templates into JavaScript rendering modules.
//!
//! ## Pipeline
//!
//! 1. **Parse**: a [`TemplateParser`] turns source text into a tree built
//!    through a [`Builder`]. The default parser is [`HtmlParser`].
//! 2. **Walk**: the [`Walker`] applies taglib transforms depth-first until
//!    every node has settled. Custom tags, conditionals and loops are all
//!    taglib entries; see [`taglibs::core`].
//! 3. **Generate**: the [`CodeGenerator`] lowers the settled tree into a
//!    [`CodeUnit`] holding both a fragment tree and the module text.
//!
//! ## Invariants
//!
//! 1. **Single owner**: a node is listed in at most one child list, and only
//!    the builder edits structure.
//! 2. **Bounded fixpoint**: a node whose transforms keep reporting changes
//!    fails with `TransformLoop` after `maxTransformPasses` passes.
//! 3. **Determinism**: equal source, taglibs and options give byte-identical
//!    code.
//! 4. **No partial output**: a fatal error returns a [`CompileFailure`]
//!    carrying the error and every warning collected before it.

use rayon::prelude::*;
use std::path::Path;

pub mod ast;
pub mod builder;
pub mod cache;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod error;
pub mod expression;
pub mod parse;
pub mod scope;
pub mod taglib;
pub mod taglibs;
pub mod visitor;
pub mod walker;

#[cfg(feature = "napi")]
mod node;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod walker_tests;

pub use ast::{Attribute, Node, NodeId, NodeKind, SourceLocation, WalkState};
pub use builder::Builder;
pub use codegen::{CodeGenerator, CodeUnit, Fragment};
pub use compiler::{CompileContext, Compiler};
pub use config::{CompileOptions, PreserveWhitespace};
pub use error::{CompileFailure, CompilerError, Diagnostic, Severity};
pub use parse::{HtmlParser, TemplateParser};
pub use taglib::{
    exit_transform_fn, transform_fn, MergeRule, Taglib, TaglibEntry, TaglibLookup, Transform,
    TransformPhase, TransformResult,
};
pub use walker::{WalkStats, Walker};

/// Compile template source with the core taglib.
pub fn compile(
    source: &str,
    file_path: &str,
    options: &CompileOptions,
) -> Result<CodeUnit, CompileFailure> {
    Compiler::new(options.clone()).compile(source, file_path)
}

/// Read and compile a template file, honouring `checkUpToDate` and
/// `writeToDisk`.
pub fn compile_file(
    path: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<CodeUnit, CompileFailure> {
    Compiler::new(options.clone()).compile_file(path)
}

pub async fn compile_file_async(
    path: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<CodeUnit, CompileFailure> {
    Compiler::new(options.clone())
        .compile_file_async(path)
        .await
}

/// Compile independent templates in parallel. Results keep the order of
/// `paths`.
pub fn compile_files<P>(compiler: &Compiler, paths: &[P]) -> Vec<Result<CodeUnit, CompileFailure>>
where
    P: AsRef<Path> + Sync,
{
    paths
        .par_iter()
        .map(|path| compiler.compile_file(path))
        .collect()
}

pub fn create_builder(file_path: &str) -> Builder {
    Builder::new(file_path)
}

pub fn create_walker(options: &CompileOptions) -> Walker {
    Walker::new(options.max_transform_passes)
}

/// Generate code for an already settled tree.
pub fn generate_code(
    builder: &Builder,
    root: NodeId,
    options: &CompileOptions,
) -> Result<CodeUnit, CompilerError> {
    CodeGenerator::new(&options.preserve_whitespace).generate_code(builder, root)
}

pub fn default_options() -> CompileOptions {
    CompileOptions::default()
}

/// Whether compiled output next to `template_path` matches its source,
/// `options` and the core taglib.
pub fn check_up_to_date(template_path: impl AsRef<Path>, options: &CompileOptions) -> bool {
    Compiler::new(options.clone()).is_up_to_date(template_path)
}

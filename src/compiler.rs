//! Compiler: sequences parse → walk → generate for one template.
//!
//! A [`Compiler`] is cheap to clone and holds only read-only state (options,
//! taglib lookup, parser), so one instance can serve many threads. Every
//! `compile` call builds its own [`CompileContext`] and discards it when the
//! call returns.

use std::path::Path;
use std::sync::Arc;

use crate::ast::NodeId;
use crate::builder::Builder;
use crate::cache;
use crate::codegen::{CodeGenerator, CodeUnit};
use crate::config::CompileOptions;
use crate::error::{CompileFailure, CompilerError, Diagnostic, Severity};
use crate::parse::{HtmlParser, TemplateParser};
use crate::taglib::{TaglibEntry, TaglibLookup};
use crate::visitor::verify_tree;
use crate::walker::Walker;

/// Per-compilation mutable state handed to every transform.
pub struct CompileContext {
    pub builder: Builder,
    pub diagnostics: Vec<Diagnostic>,
    pub options: CompileOptions,
    pub taglibs: Arc<TaglibLookup>,
    pub file_path: String,
}

impl CompileContext {
    pub fn new(builder: Builder, options: CompileOptions, taglibs: Arc<TaglibLookup>) -> Self {
        let file_path = builder.file_path().to_string();
        CompileContext {
            builder,
            diagnostics: Vec::new(),
            options,
            taglibs,
            file_path,
        }
    }

    /// Taglib entry for a tag in the current file.
    pub fn entry(&self, tag: &str) -> Option<&TaglibEntry> {
        self.taglibs.lookup(tag, &self.file_path)
    }

    /// Error diagnostic positioned at `node`.
    pub fn error_at(&self, node: NodeId, code: &str, message: impl Into<String>) -> Diagnostic {
        let n = self.builder.node(node);
        Diagnostic::error(code, message, &self.file_path, n.location()).with_context(n.describe())
    }

    /// Record a non-fatal warning positioned at `node`.
    pub fn warn(&mut self, node: NodeId, code: &str, message: impl Into<String>) {
        let n = self.builder.node(node);
        let warning = Diagnostic::warning(code, message, &self.file_path, n.location())
            .with_context(n.describe());
        self.diagnostics.push(warning);
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}

#[derive(Clone)]
pub struct Compiler {
    options: CompileOptions,
    taglibs: Arc<TaglibLookup>,
    parser: Arc<dyn TemplateParser>,
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new(CompileOptions::default())
    }
}

impl Compiler {
    /// A compiler with the core taglib and the HTML parser.
    pub fn new(options: CompileOptions) -> Self {
        Compiler {
            options,
            taglibs: Arc::new(TaglibLookup::with_core()),
            parser: Arc::new(HtmlParser),
        }
    }

    pub fn with_taglibs(mut self, taglibs: Arc<TaglibLookup>) -> Self {
        self.taglibs = taglibs;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn TemplateParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn taglibs(&self) -> &Arc<TaglibLookup> {
        &self.taglibs
    }

    /// Compile template source. Nothing touches storage.
    pub fn compile(&self, source: &str, file_path: &str) -> Result<CodeUnit, CompileFailure> {
        log::debug!("compiling {} ({} bytes)", file_path, source.len());

        let mut builder = Builder::new(file_path);
        let root = self.parser.parse(source, &mut builder)?;
        log::debug!("parsed {} into {} nodes", file_path, builder.len());

        let mut ctx = CompileContext::new(builder, self.options.clone(), Arc::clone(&self.taglibs));
        let walked = Walker::new(self.options.max_transform_passes)
            .walk(root, &mut ctx)
            .and_then(|_| verify_tree(&ctx.builder, root));
        if let Err(error) = walked {
            return Err(self.failure(error, &ctx));
        }

        let generated = CodeGenerator::new(&self.options.preserve_whitespace)
            .generate_code(&ctx.builder, root);
        match generated {
            Ok(mut unit) => {
                unit.warnings = ctx.warnings().cloned().collect();
                log::debug!(
                    "generated {} ({} bytes, {} warnings)",
                    file_path,
                    unit.code.len(),
                    unit.warnings.len()
                );
                Ok(unit)
            }
            Err(error) => Err(self.failure(error, &ctx)),
        }
    }

    fn failure(&self, error: CompilerError, ctx: &CompileContext) -> CompileFailure {
        log::debug!("compilation of {} failed: {}", ctx.file_path, error);
        CompileFailure {
            error,
            warnings: ctx.warnings().cloned().collect(),
        }
    }

    /// Read, compile and (when `write_to_disk` is set) persist a template.
    /// Up-to-date output on disk is returned without recompiling.
    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<CodeUnit, CompileFailure> {
        let path = path.as_ref();
        let file_path = path.to_string_lossy().to_string();
        let source = cache::read_template_source(path)?;
        let compiled = cache::compiled_path(path, &self.options.compiled_suffix);
        let key = self.cache_key(&source);

        if self.uses_cache() {
            if let Some(code) = cache::read_cached(&key, &compiled) {
                log::debug!("{} is up to date", compiled.display());
                return Ok(CodeUnit::cached(&file_path, code));
            }
        }

        let unit = self.compile(&source, &file_path)?;
        if self.options.write_to_disk {
            cache::write_compiled_output(&compiled, &key, &unit.code)?;
        }
        Ok(unit)
    }

    /// Async adapter over [`Compiler::compile`]: only file reads and writes
    /// suspend. Every failure comes back through the returned `Result`.
    pub async fn compile_file_async(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<CodeUnit, CompileFailure> {
        let path = path.as_ref();
        let file_path = path.to_string_lossy().to_string();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CompilerError::io(file_path.clone(), e))?;
        let compiled = cache::compiled_path(path, &self.options.compiled_suffix);
        let key = self.cache_key(&source);

        if self.uses_cache() {
            if let Ok(existing) = tokio::fs::read_to_string(&compiled).await {
                if let Some(code) = cache::cached_code(&key, &existing) {
                    log::debug!("{} is up to date", compiled.display());
                    return Ok(CodeUnit::cached(&file_path, code));
                }
            }
        }

        let unit = self.compile(&source, &file_path)?;
        if self.options.write_to_disk {
            tokio::fs::write(&compiled, cache::stamp(&key, &unit.code))
                .await
                .map_err(|e| CompilerError::io(compiled.to_string_lossy(), e))?;
        }
        Ok(unit)
    }

    /// Whether output next to `path` was generated from its current source
    /// by a compiler configured like this one.
    pub fn is_up_to_date(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        cache::is_up_to_date(
            path,
            &cache::compiled_path(path, &self.options.compiled_suffix),
            &self.options,
            &self.taglibs,
        )
    }

    fn cache_key(&self, source: &str) -> String {
        cache::cache_key(source, &self.options, &self.taglibs)
    }

    fn uses_cache(&self) -> bool {
        self.options.write_to_disk && self.options.check_up_to_date
    }
}

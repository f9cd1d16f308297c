//! Diagnostics and the compiler error taxonomy.
//!
//! Every failure the pipeline can produce is a [`CompilerError`]; every
//! variant except I/O carries a [`Diagnostic`] pointing at the originating
//! node. Warnings are plain diagnostics with [`Severity::Warning`] that travel
//! alongside a successful result (or alongside the error in a
//! [`CompileFailure`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ast::SourceLocation;

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_PARSE: &str = "TPL-ERR-PARSE";
pub const ERR_UNKNOWN_TAG: &str = "TPL-ERR-UNKNOWN-TAG";
pub const ERR_INVALID_NODE_KIND: &str = "TPL-ERR-INVALID-NODE-KIND";
pub const ERR_INVALID_ATTRIBUTE: &str = "TPL-ERR-INVALID-ATTRIBUTE";
pub const ERR_INVALID_NESTING: &str = "TPL-ERR-INVALID-NESTING";
pub const ERR_DETACHED_NODE: &str = "TPL-ERR-DETACHED-NODE";
pub const ERR_TRANSFORM_LOOP: &str = "TPL-ERR-TRANSFORM-LOOP";
pub const ERR_UNSUPPORTED_NODE: &str = "TPL-ERR-UNSUPPORTED-NODE";
pub const ERR_IO: &str = "TPL-ERR-IO";
pub const WARN_DEPRECATED_TAG: &str = "TPL-WARN-DEPRECATED-TAG";
pub const WARN_UNKNOWN_TAG: &str = "TPL-WARN-UNKNOWN-TAG";

fn hint_for(code: &str) -> Option<&'static str> {
    match code {
        ERR_PARSE => Some("Check for unclosed `${` placeholders and malformed markup."),
        ERR_UNKNOWN_TAG => Some(
            "Register a taglib entry for this tag or enable `allowUnknownTags` to pass it through.",
        ),
        ERR_INVALID_ATTRIBUTE => Some("Attribute expressions must be valid JavaScript."),
        ERR_INVALID_NESTING => Some("Branch tags must follow or be nested inside their parent tag."),
        ERR_DETACHED_NODE | ERR_UNSUPPORTED_NODE => {
            Some("This indicates a bug in a taglib transform, not in the template.")
        }
        ERR_TRANSFORM_LOOP => Some(
            "A transform keeps rewriting this tag. Make transforms return `Unchanged` once applied.",
        ),
        WARN_DEPRECATED_TAG => Some("Deprecated tags will be removed in a future release."),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn error(code: &str, message: impl Into<String>, file: &str, at: SourceLocation) -> Self {
        Self::with_severity(Severity::Error, code, message.into(), file, at)
    }

    pub fn warning(code: &str, message: impl Into<String>, file: &str, at: SourceLocation) -> Self {
        Self::with_severity(Severity::Warning, code, message.into(), file, at)
    }

    fn with_severity(
        severity: Severity,
        code: &str,
        message: String,
        file: &str,
        at: SourceLocation,
    ) -> Self {
        Diagnostic {
            code: code.to_string(),
            severity,
            message,
            file: file.to_string(),
            line: at.line,
            column: at.column,
            context: None,
            hints: hint_for(code).map(|h| vec![h.to_string()]).unwrap_or_default(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn location(&self) -> SourceLocation {
        SourceLocation {
            line: self.line,
            column: self.column,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}:{}:{})",
            self.code, self.message, self.file, self.line, self.column
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("parse error: {0}")]
    Parse(Diagnostic),

    #[error("unknown tag: {0}")]
    UnknownTag(Diagnostic),

    #[error("invalid node kind: {0}")]
    InvalidNodeKind(Diagnostic),

    #[error("invalid attribute: {0}")]
    InvalidAttribute(Diagnostic),

    #[error("invalid nesting: {0}")]
    InvalidNesting(Diagnostic),

    #[error("detached node: {0}")]
    DetachedNode(Diagnostic),

    #[error("transform loop: {0}")]
    TransformLoop(Diagnostic),

    #[error("unsupported node kind: {0}")]
    UnsupportedNodeKind(Diagnostic),

    #[error("failed to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CompilerError {
    /// The diagnostic behind this error, if it has a source position.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            CompilerError::Parse(d)
            | CompilerError::UnknownTag(d)
            | CompilerError::InvalidNodeKind(d)
            | CompilerError::InvalidAttribute(d)
            | CompilerError::InvalidNesting(d)
            | CompilerError::DetachedNode(d)
            | CompilerError::TransformLoop(d)
            | CompilerError::UnsupportedNodeKind(d) => Some(d),
            CompilerError::Io { .. } => None,
        }
    }

    pub fn code(&self) -> &str {
        match self.diagnostic() {
            Some(d) => &d.code,
            None => ERR_IO,
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        CompilerError::Io {
            path: path.into(),
            source,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AGGREGATED FAILURE
// ═══════════════════════════════════════════════════════════════════════════════

/// The single failure returned by a compilation: the fatal error plus every
/// warning collected before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CompileFailure {
    #[source]
    pub error: CompilerError,
    pub warnings: Vec<Diagnostic>,
}

impl From<CompilerError> for CompileFailure {
    fn from(error: CompilerError) -> Self {
        CompileFailure {
            error,
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display_includes_position() {
        let d = Diagnostic::error(
            ERR_UNKNOWN_TAG,
            "Unknown tag <fancy-box>",
            "views/page.html",
            SourceLocation { line: 3, column: 5 },
        );
        assert_eq!(
            d.to_string(),
            "[TPL-ERR-UNKNOWN-TAG] Unknown tag <fancy-box> (views/page.html:3:5)"
        );
        assert_eq!(d.hints.len(), 1);
    }

    #[test]
    fn test_error_code_lookup() {
        let err = CompilerError::TransformLoop(Diagnostic::error(
            ERR_TRANSFORM_LOOP,
            "loop",
            "a.html",
            SourceLocation::default(),
        ));
        assert_eq!(err.code(), ERR_TRANSFORM_LOOP);

        let io = CompilerError::io("missing.html", std::io::Error::other("gone"));
        assert_eq!(io.code(), ERR_IO);
        assert!(io.diagnostic().is_none());
    }
}

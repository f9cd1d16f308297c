//! Storage for compiled templates.
//!
//! Compiled output starts with a header holding a SHA-256 cache key. The key
//! covers the template source, the options that change generated code and the
//! taglib registrations in effect. Output is up to date when its key matches
//! the current one; modification times are never consulted.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CompileOptions;
use crate::error::CompilerError;
use crate::taglib::TaglibLookup;

pub const HASH_HEADER: &str = "// source-sha256: ";

pub fn compute_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key identifying the output of compiling `source` with `options` against
/// `taglibs`.
pub fn cache_key(source: &str, options: &CompileOptions, taglibs: &TaglibLookup) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(options.output_fingerprint().as_bytes());
    hasher.update([0u8]);
    hasher.update(taglibs.fingerprint().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `views/page.html` + `.js` → `views/page.html.js`.
pub fn compiled_path(template_path: &Path, suffix: &str) -> PathBuf {
    let mut name = template_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn read_template_source(path: &Path) -> Result<String, CompilerError> {
    fs::read_to_string(path).map_err(|e| CompilerError::io(path.to_string_lossy(), e))
}

/// Compiled code prefixed with the header for `key`.
pub fn stamp(key: &str, code: &str) -> String {
    format!("{}{}\n{}", HASH_HEADER, key, code)
}

pub fn write_compiled_output(path: &Path, key: &str, code: &str) -> Result<(), CompilerError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| CompilerError::io(dir.to_string_lossy(), e))?;
    }
    fs::write(path, stamp(key, code)).map_err(|e| CompilerError::io(path.to_string_lossy(), e))
}

/// The code stored in `compiled` if it was generated under `key`.
pub fn cached_code(key: &str, compiled: &str) -> Option<String> {
    let (header, code) = compiled.split_once('\n')?;
    let stored = header.strip_prefix(HASH_HEADER)?;
    if stored == key {
        Some(code.to_string())
    } else {
        None
    }
}

/// Read output generated under `key` from `compiled_path`. Missing, stale
/// or headerless output yields `None`.
pub fn read_cached(key: &str, compiled_path: &Path) -> Option<String> {
    let compiled = fs::read_to_string(compiled_path).ok()?;
    if !compiled.starts_with(HASH_HEADER) {
        log::warn!(
            "{} has no cache key header; recompiling",
            compiled_path.display()
        );
        return None;
    }
    cached_code(key, &compiled)
}

/// Whether the output at `compiled_path` was generated from the current
/// contents of `template_path` with the same options and taglibs.
pub fn is_up_to_date(
    template_path: &Path,
    compiled_path: &Path,
    options: &CompileOptions,
    taglibs: &TaglibLookup,
) -> bool {
    match fs::read_to_string(template_path) {
        Ok(source) => read_cached(&cache_key(&source, options, taglibs), compiled_path).is_some(),
        Err(e) => {
            log::warn!("cannot read {}: {}", template_path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreserveWhitespace;
    use crate::taglib::{Taglib, TaglibEntry};

    #[test]
    fn test_compiled_path_appends_suffix() {
        assert_eq!(
            compiled_path(Path::new("views/page.html"), ".js"),
            PathBuf::from("views/page.html.js")
        );
    }

    #[test]
    fn test_round_trip_and_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("page.html");
        let compiled = compiled_path(&template, ".js");
        let options = CompileOptions::default();
        let taglibs = TaglibLookup::with_core();
        fs::write(&template, "<p>one</p>").unwrap();

        assert!(!is_up_to_date(&template, &compiled, &options, &taglibs));
        let key = cache_key("<p>one</p>", &options, &taglibs);
        write_compiled_output(&compiled, &key, "module.exports = 1;\n").unwrap();
        assert!(is_up_to_date(&template, &compiled, &options, &taglibs));
        assert_eq!(
            read_cached(&key, &compiled).as_deref(),
            Some("module.exports = 1;\n")
        );

        fs::write(&template, "<p>two</p>").unwrap();
        assert!(!is_up_to_date(&template, &compiled, &options, &taglibs));
    }

    #[test]
    fn test_key_covers_options_and_taglibs() {
        let options = CompileOptions::default();
        let core = TaglibLookup::with_core();
        let key = cache_key("<p></p>", &options, &core);
        assert_eq!(key, cache_key("<p></p>", &options, &TaglibLookup::with_core()));
        assert_ne!(key, compute_hash("<p></p>"));

        let mut preserving = options.clone();
        preserving.preserve_whitespace = PreserveWhitespace::All(true);
        assert_ne!(key, cache_key("<p></p>", &preserving, &core));

        let mut storage_only = options.clone();
        storage_only.write_to_disk = false;
        storage_only.compiled_suffix = ".cjs".to_string();
        assert_eq!(key, cache_key("<p></p>", &storage_only, &core));

        let mut extended = TaglibLookup::with_core();
        extended.register(Taglib::new("ui").entry(TaglibEntry::new("card").renderer("./card")));
        assert_ne!(key, cache_key("<p></p>", &options, &extended));
    }

    #[test]
    fn test_headerless_output_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let compiled = dir.path().join("page.html.js");
        fs::write(&compiled, "module.exports = 1;").unwrap();
        assert!(read_cached(&compute_hash("<p></p>"), &compiled).is_none());
    }

    #[test]
    fn test_missing_template_is_io_error() {
        let err = read_template_source(Path::new("/definitely/missing.html")).unwrap_err();
        assert!(matches!(err, CompilerError::Io { .. }));
    }
}

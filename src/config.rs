//! Compiler configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::walker::DEFAULT_MAX_TRANSFORM_PASSES;

/// Which tags keep their whitespace verbatim.
///
/// Deserializes from `true`/`false` or from an object such as
/// `{"pre": true, "textarea": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreserveWhitespace {
    All(bool),
    Tags(BTreeMap<String, bool>),
}

impl Default for PreserveWhitespace {
    fn default() -> Self {
        PreserveWhitespace::Tags(
            ["pre", "textarea", "script"]
                .into_iter()
                .map(|tag| (tag.to_string(), true))
                .collect(),
        )
    }
}

impl PreserveWhitespace {
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PreserveWhitespace::Tags(tags.into_iter().map(|t| (t.into(), true)).collect())
    }

    pub fn everywhere(&self) -> bool {
        matches!(self, PreserveWhitespace::All(true))
    }

    pub fn preserves(&self, tag: &str) -> bool {
        match self {
            PreserveWhitespace::All(all) => *all,
            PreserveWhitespace::Tags(tags) => tags
                .get(tag)
                .or_else(|| tags.get(&tag.to_ascii_lowercase()))
                .copied()
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    pub preserve_whitespace: PreserveWhitespace,
    /// Reuse compiled output on disk when it matches the current source.
    /// Ignored unless `write_to_disk` is set.
    pub check_up_to_date: bool,
    pub write_to_disk: bool,
    /// Pass tags without a taglib entry through as plain elements.
    pub allow_unknown_tags: bool,
    pub max_transform_passes: usize,
    /// Appended to a template path to name its compiled output.
    pub compiled_suffix: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            preserve_whitespace: PreserveWhitespace::default(),
            check_up_to_date: true,
            write_to_disk: true,
            allow_unknown_tags: false,
            max_transform_passes: DEFAULT_MAX_TRANSFORM_PASSES,
            compiled_suffix: ".js".to_string(),
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The options that change generated code, as canonical JSON. Storage
    /// flags and the output suffix are left out.
    pub fn output_fingerprint(&self) -> String {
        serde_json::json!({
            "preserveWhitespace": self.preserve_whitespace,
            "allowUnknownTags": self.allow_unknown_tags,
            "maxTransformPasses": self.max_transform_passes,
        })
        .to_string()
    }

    /// Options for purely in-memory compilation.
    pub fn in_memory() -> Self {
        CompileOptions {
            check_up_to_date: false,
            write_to_disk: false,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CompileOptions::default();
        assert!(options.preserve_whitespace.preserves("pre"));
        assert!(options.preserve_whitespace.preserves("textarea"));
        assert!(!options.preserve_whitespace.preserves("div"));
        assert!(options.check_up_to_date);
        assert!(options.write_to_disk);
    }

    #[test]
    fn test_preserve_whitespace_from_json() {
        let options = CompileOptions::from_json(r#"{"preserveWhitespace": true}"#).unwrap();
        assert!(options.preserve_whitespace.everywhere());
        assert!(options.preserve_whitespace.preserves("span"));

        let options =
            CompileOptions::from_json(r#"{"preserveWhitespace": {"pre": true, "code": false}}"#)
                .unwrap();
        assert!(options.preserve_whitespace.preserves("pre"));
        assert!(!options.preserve_whitespace.preserves("code"));
        assert!(!options.preserve_whitespace.preserves("textarea"));
    }

    #[test]
    fn test_output_fingerprint_ignores_storage_flags() {
        let base = CompileOptions::default();
        assert_eq!(
            base.output_fingerprint(),
            CompileOptions::in_memory().output_fingerprint()
        );

        let mut preserving = CompileOptions::default();
        preserving.preserve_whitespace = PreserveWhitespace::All(true);
        assert_ne!(base.output_fingerprint(), preserving.output_fingerprint());

        let mut lenient = CompileOptions::default();
        lenient.allow_unknown_tags = true;
        assert_ne!(base.output_fingerprint(), lenient.output_fingerprint());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options =
            CompileOptions::from_json(r#"{"writeToDisk": false, "allowUnknownTags": true}"#)
                .unwrap();
        assert!(!options.write_to_disk);
        assert!(options.allow_unknown_tags);
        assert_eq!(options.max_transform_passes, DEFAULT_MAX_TRANSFORM_PASSES);
        assert_eq!(options.compiled_suffix, ".js");
    }
}

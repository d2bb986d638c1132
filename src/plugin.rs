//! Pluggable capabilities of the pipeline.
//!
//! The dispatcher never depends on a concrete compiler, transpiler,
//! rewriter or package source. Each is a trait object injected at
//! construction:
//! - [`ComponentCompiler`]: single-file component → blocks → module
//! - [`ScriptPreprocessor`]: non-JS script block → JavaScript
//! - [`ModuleRewriter`]: bare import specifiers → virtual module URLs
//! - [`PackageResolver`]: package name → browser ESM bytes

pub mod module_cache;
pub mod sfc_loader;
pub mod single_flight;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils;
use crate::{Diagnostic, Result};

// ---------------------------------------------------------------------------
// Source maps
// ---------------------------------------------------------------------------

/// Source map (revision 3) attached to a compiled block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub sources: Vec<String>,
    #[serde(default)]
    pub sources_content: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    /// Map `line_count` generated lines one-to-one onto the original file,
    /// starting at zero-based `start_line`. Every segment maps column 0.
    pub fn line_map(source: &str, content: &str, start_line: usize, line_count: usize) -> Self {
        let mut mappings = String::new();
        for line in 0..line_count {
            if line == 0 {
                mappings.push_str("AA");
                utils::encode_vlq(start_line as i64, &mut mappings);
                mappings.push('A');
            } else {
                mappings.push_str(";AACA");
            }
        }

        Self {
            version: 3,
            file: None,
            sources: vec![source.to_string()],
            sources_content: vec![content.to_string()],
            names: Vec::new(),
            mappings,
        }
    }
}

// ---------------------------------------------------------------------------
// Component compiler
// ---------------------------------------------------------------------------

/// One compiled script or style block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledBlock {
    pub code: String,
    pub map: Option<SourceMap>,
    /// `lang` attribute as written in the source, if any.
    pub lang: Option<String>,
}

impl CompiledBlock {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_map(mut self, map: SourceMap) -> Self {
        self.map = Some(map);
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }
}

/// Output of [`ComponentCompiler::compile_to_descriptor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledDescriptor {
    pub script: CompiledBlock,
    pub styles: Vec<CompiledBlock>,
    /// Markup of the component, forwarded untouched to the assembler.
    pub template: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Black-box single-file component compiler.
pub trait ComponentCompiler: Send + Sync {
    /// Split and compile `source`. Problems are reported as diagnostics;
    /// any error-level diagnostic aborts the request.
    fn compile_to_descriptor(&self, filepath: &Path, source: &str) -> CompiledDescriptor;

    /// Join the script and style outputs into one executable module.
    fn assemble(&self, filepath: &Path, descriptor: &CompiledDescriptor) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Script preprocessor
// ---------------------------------------------------------------------------

/// Transpiled script text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preprocessed {
    pub code: String,
    pub map: Option<SourceMap>,
}

/// Transpiles a script block written in a non-default language.
pub trait ScriptPreprocessor: Send + Sync {
    /// The `lang` attribute value this preprocessor handles, e.g. `ts`.
    fn lang(&self) -> &str;

    fn process(&self, filepath: &Path, code: &str) -> Result<Preprocessed>;
}

// ---------------------------------------------------------------------------
// Module rewriter
// ---------------------------------------------------------------------------

/// Rewrites import specifiers of an ES module.
pub trait ModuleRewriter: Send + Sync {
    fn rewrite(&self, source: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Package resolver
// ---------------------------------------------------------------------------

/// Produces a browser-runnable ES module for a package name.
#[async_trait]
pub trait PackageResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_map_mappings() {
        let map = SourceMap::line_map("App.vue", "<script>\n</script>", 1, 3);
        assert_eq!(map.mappings, "AACA;AACA;AACA");
        assert_eq!(map.sources, vec!["App.vue"]);

        let map = SourceMap::line_map("App.vue", "", 0, 2);
        assert_eq!(map.mappings, "AAAA;AACA");

        let map = SourceMap::line_map("App.vue", "", 4, 0);
        assert_eq!(map.mappings, "");
    }

    #[test]
    fn source_map_json_shape() {
        let map = SourceMap::line_map("App.vue", "src", 0, 1);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["sourcesContent"][0], "src");
        assert!(json.get("file").is_none());
    }
}

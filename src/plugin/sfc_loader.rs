//! SFC loader: wraps a [`ComponentCompiler`] with the post-processing
//! the dev server needs before assembly.
//!
//! Steps, in order:
//! - compile to a descriptor and report diagnostics
//! - run the script block through its `lang` preprocessor
//! - embed base64 source maps (when enabled)
//! - assemble the final module via the compiler
//!
//! **Invariants:**
//! - Same source in, same bytes out
//! - A source map comment is appended at most once per block
//! - Any error-level diagnostic aborts; warnings are only logged

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use crate::plugin::{
    CompiledBlock, CompiledDescriptor, ComponentCompiler, ScriptPreprocessor, SourceMap,
};
use crate::{DiagnosticLevel, PipelineError, Result};

/// Data URL prefix of every embedded source map.
pub const SOURCE_MAP_DATA_URL: &str = "data:application/json;base64,";

/// Body of a source map comment, after its `//` or `/*` opener.
pub const SOURCE_MAP_MARKER: &str = "# sourceMappingURL=";

/// Script `lang` values that need no preprocessing.
const NATIVE_SCRIPT_LANGS: &[&str] = &["js", "javascript"];

/// Configuration for the SFC loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SfcLoaderConfig {
    /// Embed block source maps as base64 data URLs.
    pub source_maps: bool,
}

/// Component transformer used by the dispatcher for component requests.
pub struct SfcLoader {
    config: SfcLoaderConfig,
    compiler: Arc<dyn ComponentCompiler>,
    preprocessors: HashMap<String, Arc<dyn ScriptPreprocessor>>,
}

impl fmt::Debug for SfcLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut langs: Vec<_> = self.preprocessors.keys().collect();
        langs.sort();
        f.debug_struct("SfcLoader")
            .field("config", &self.config)
            .field("preprocessors", &langs)
            .finish()
    }
}

impl SfcLoader {
    pub fn new(compiler: Arc<dyn ComponentCompiler>, config: SfcLoaderConfig) -> Self {
        Self {
            config,
            compiler,
            preprocessors: HashMap::new(),
        }
    }

    /// Register a preprocessor for its `lang`. A later registration for the
    /// same `lang` replaces the earlier one.
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn ScriptPreprocessor>) -> Self {
        self.preprocessors
            .insert(preprocessor.lang().to_string(), preprocessor);
        self
    }

    /// Swap the component compiler, keeping registered preprocessors.
    pub fn with_compiler(mut self, compiler: Arc<dyn ComponentCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn config(&self) -> SfcLoaderConfig {
        self.config
    }

    /// Compile `source` into a post-processed descriptor, ready to assemble.
    pub fn compile(&self, filepath: &Path, source: &str) -> Result<CompiledDescriptor> {
        // Normalize newlines to LF for determinism (CRLF -> LF)
        let source = source.replace("\r\n", "\n");
        let mut descriptor = self.compiler.compile_to_descriptor(filepath, &source);

        report_diagnostics(filepath, &descriptor)?;

        descriptor.script = self.preprocess_script(filepath, descriptor.script)?;

        if self.config.source_maps {
            inject_script_source_map(&mut descriptor.script)?;
            for style in &mut descriptor.styles {
                inject_style_source_map(style)?;
            }
        }

        Ok(descriptor)
    }

    /// Compile and assemble `source` into one executable module.
    pub fn transform(&self, filepath: &Path, source: &str) -> Result<String> {
        let descriptor = self.compile(filepath, source)?;
        self.compiler.assemble(filepath, &descriptor)
    }

    fn preprocess_script(&self, filepath: &Path, script: CompiledBlock) -> Result<CompiledBlock> {
        let lang = match script.lang.as_deref() {
            None => return Ok(script),
            Some(lang) if NATIVE_SCRIPT_LANGS.contains(&lang) => return Ok(script),
            Some(lang) => lang,
        };

        let preprocessor = self.preprocessors.get(lang).ok_or_else(|| {
            PipelineError::compile(
                filepath,
                format!("no script preprocessor registered for lang=\"{lang}\""),
            )
        })?;

        let processed = preprocessor.process(filepath, &script.code)?;
        Ok(CompiledBlock {
            code: processed.code,
            // The transpiler's map replaces the compiler's for this block.
            map: processed.map.or(script.map),
            lang: None,
        })
    }
}

/// Log warnings; turn error-level diagnostics into one compile error.
fn report_diagnostics(filepath: &Path, descriptor: &CompiledDescriptor) -> Result<()> {
    let mut errors = Vec::new();
    for diagnostic in &descriptor.diagnostics {
        match diagnostic.level {
            DiagnosticLevel::Error => errors.push(diagnostic.message.as_str()),
            DiagnosticLevel::Warning => warn!(
                file = %filepath.display(),
                context = diagnostic.context.as_deref().unwrap_or(""),
                "{}",
                diagnostic.message
            ),
            DiagnosticLevel::Info => info!(file = %filepath.display(), "{}", diagnostic.message),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::compile(filepath, errors.join("; ")))
    }
}

// ---------------------------------------------------------------------------
// Source map embedding
// ---------------------------------------------------------------------------

/// Encode a source map as a `data:` URL.
pub fn source_map_data_url(map: &SourceMap) -> Result<String> {
    let json = serde_json::to_vec(map).map_err(|e| {
        PipelineError::compile(
            map.sources.first().map(String::as_str).unwrap_or_default(),
            format!("failed to serialize source map: {e}"),
        )
    })?;
    Ok(format!("{}{}", SOURCE_MAP_DATA_URL, STANDARD.encode(json)))
}

/// Whether the last non-blank line of `code` is a source map comment.
fn has_trailing_source_map(code: &str) -> bool {
    code.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.strip_prefix("//").or_else(|| line.strip_prefix("/*")))
        .is_some_and(|rest| rest.starts_with(SOURCE_MAP_MARKER))
}

/// Append `//# sourceMappingURL=...` to a script block that has a map.
pub fn inject_script_source_map(block: &mut CompiledBlock) -> Result<()> {
    let Some(map) = &block.map else {
        return Ok(());
    };
    if has_trailing_source_map(&block.code) {
        return Ok(());
    }
    let url = source_map_data_url(map)?;
    if !block.code.ends_with('\n') {
        block.code.push('\n');
    }
    block.code.push_str(&format!("//{SOURCE_MAP_MARKER}{url}"));
    Ok(())
}

/// Append `/*# sourceMappingURL=...*/` to a style block that has a map.
pub fn inject_style_source_map(block: &mut CompiledBlock) -> Result<()> {
    let Some(map) = &block.map else {
        return Ok(());
    };
    if has_trailing_source_map(&block.code) {
        return Ok(());
    }
    let url = source_map_data_url(map)?;
    if !block.code.ends_with('\n') {
        block.code.push('\n');
    }
    block.code.push_str(&format!("/*{SOURCE_MAP_MARKER}{url}*/"));
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

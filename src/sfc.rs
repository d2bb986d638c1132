//! Built-in single-file component compiler.
//!
//! Splits a component into its top-level `<template>`, `<script>` and
//! `<style>` blocks and assembles them into one ES module:
//!
//! ```text
//! <script> body, `export default` bound to `__sfc__`
//! __sfc__.template = `...`;
//! style injection (one <style> element per block)
//! export default __sfc__;
//! ```
//!
//! Template compilation to render functions is left to the browser-side
//! runtime, which accepts a `template` string option.

use std::ops::Range;
use std::path::Path;

use regex::Regex;

use crate::plugin::{CompiledBlock, CompiledDescriptor, ComponentCompiler, SourceMap};
use crate::rewrite::{self, TokenKind};
use crate::utils::{escape_js_string, escape_js_template_literal};
use crate::{Diagnostic, PipelineError, Result};

/// Identifier the component options object is bound to.
pub const COMPONENT_BINDING: &str = "__sfc__";

/// Script `lang` values scanned at compile time. Other languages are only
/// scanned after preprocessing, in `assemble`.
const PLAIN_SCRIPT_LANGS: &[&str] = &["js", "javascript"];

const UNSUPPORTED_DEFAULT_SPECIFIER: &str =
    "`export { ... as default }` is not supported in a component; use `export default`";

const TEMPLATE_OPEN: &str = "<template";
const TEMPLATE_CLOSE: &str = "</template>";

/// Runtime snippet appending each style block to `document.head`.
const STYLE_INJECTOR: &str = r#"if (typeof document !== "undefined") {
  for (const css of __sfc_styles__) {
    const el = document.createElement("style");
    el.textContent = css;
    document.head.appendChild(el);
  }
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Template,
    Script,
    Style,
}

impl BlockKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "template" => Some(Self::Template),
            "script" => Some(Self::Script),
            "style" => Some(Self::Style),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Script => "script",
            Self::Style => "style",
        }
    }
}

#[derive(Debug)]
struct RawBlock {
    kind: BlockKind,
    lang: Option<String>,
    content: String,
    /// Zero-based line of the first content character.
    start_line: usize,
}

/// Regex-driven block splitter and assembler.
#[derive(Debug, Clone)]
pub struct SfcCompiler {
    open_tag: Regex,
    attribute: Regex,
}

impl Default for SfcCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SfcCompiler {
    pub fn new() -> Self {
        Self {
            open_tag: Regex::new(r"<(template|script|style)(\s[^>]*)?>")
                .expect("block tag pattern is valid"),
            attribute: Regex::new(
                r#"([A-Za-z_:@][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#,
            )
            .expect("attribute pattern is valid"),
        }
    }

    fn lang_attribute(&self, attrs: &str) -> Option<String> {
        self.attribute.captures_iter(attrs).find_map(|cap| {
            if &cap[1] != "lang" {
                return None;
            }
            cap.get(2)
                .or(cap.get(3))
                .or(cap.get(4))
                .map(|m| m.as_str().trim().to_string())
                .filter(|lang| !lang.is_empty())
        })
    }

    /// Collect top-level blocks. Content outside blocks and inside
    /// top-level HTML comments is skipped.
    fn parse_blocks(&self, source: &str, diagnostics: &mut Vec<Diagnostic>) -> Vec<RawBlock> {
        let mut blocks = Vec::new();
        let mut cursor = 0;

        while cursor < source.len() {
            let rest = &source[cursor..];
            let Some(cap) = self.open_tag.captures(rest) else {
                break;
            };
            let Some(whole) = cap.get(0) else {
                break;
            };
            let tag_start = cursor + whole.start();

            if let Some(comment) = rest.find("<!--") {
                let comment_start = cursor + comment;
                if comment_start < tag_start {
                    cursor = match source[comment_start..].find("-->") {
                        Some(end) => comment_start + end + 3,
                        None => source.len(),
                    };
                    continue;
                }
            }

            let Some(kind) = BlockKind::from_tag(&cap[1]) else {
                break;
            };
            let lang = cap.get(2).and_then(|attrs| self.lang_attribute(attrs.as_str()));
            let content_start = cursor + whole.end();

            let close = match kind {
                BlockKind::Template => find_template_close(source, content_start),
                BlockKind::Script => source[content_start..]
                    .find("</script>")
                    .map(|i| content_start + i),
                BlockKind::Style => source[content_start..]
                    .find("</style>")
                    .map(|i| content_start + i),
            };

            let Some(close) = close else {
                let line = source[..tag_start].matches('\n').count() + 1;
                diagnostics.push(
                    Diagnostic::error(format!("missing closing </{}> tag", kind.tag()))
                        .with_context(format!("block opened at line {line}")),
                );
                break;
            };

            blocks.push(RawBlock {
                kind,
                lang,
                content: source[content_start..close].to_string(),
                start_line: source[..content_start].matches('\n').count(),
            });

            cursor = close + kind.tag().len() + 3;
        }

        blocks
    }
}

/// Find the `</template>` closing the template opened before `from`,
/// skipping nested `<template>` elements.
fn find_template_close(source: &str, from: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut pos = from;

    loop {
        let close = pos + source[pos..].find(TEMPLATE_CLOSE)?;
        match find_template_open(source, pos) {
            Some(open) if open < close => {
                depth += 1;
                pos = open + TEMPLATE_OPEN.len();
            }
            _ => {
                depth -= 1;
                if depth == 0 {
                    return Some(close);
                }
                pos = close + TEMPLATE_CLOSE.len();
            }
        }
    }
}

fn find_template_open(source: &str, from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(i) = source[pos..].find(TEMPLATE_OPEN) {
        let start = pos + i;
        let after = start + TEMPLATE_OPEN.len();
        match source[after..].chars().next() {
            Some(c) if c == '>' || c.is_whitespace() => return Some(start),
            _ => pos = after,
        }
    }
    None
}

/// How a script hands its component options to the module.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DefaultExport {
    /// `export default <expr>`; the span covers both keywords.
    Expression(Range<usize>),
    /// `export { local as default }` or a re-exported `default`.
    Specifier,
    Missing,
}

/// Find the script's default export among real statements, ignoring the
/// same words inside comments, strings and templates.
fn locate_default_export(script: &str) -> Result<DefaultExport> {
    let tokens = rewrite::tokenize(script)?;

    for (i, token) in tokens.iter().enumerate() {
        if !token.is_ident(script, "export") || !rewrite::at_statement_start(&tokens, i) {
            continue;
        }
        let Some(next) = tokens.get(i + 1) else {
            continue;
        };
        if next.is_ident(script, "default") {
            return Ok(DefaultExport::Expression(token.span.start..next.span.end));
        }
        if next.kind != TokenKind::Punct(b'{') {
            continue;
        }

        // export { a, b as default, default as c }
        let clause: Vec<_> = tokens[i + 2..]
            .iter()
            .take_while(|t| t.kind != TokenKind::Punct(b'}'))
            .collect();
        for (j, t) in clause.iter().enumerate() {
            if !t.is_ident(script, "default") {
                continue;
            }
            let renamed_to = j > 0 && clause[j - 1].is_ident(script, "as");
            let renamed_from = clause.get(j + 1).is_some_and(|n| n.is_ident(script, "as"));
            if renamed_to || !renamed_from {
                return Ok(DefaultExport::Specifier);
            }
        }
    }

    Ok(DefaultExport::Missing)
}

impl ComponentCompiler for SfcCompiler {
    fn compile_to_descriptor(&self, filepath: &Path, source: &str) -> CompiledDescriptor {
        let mut diagnostics = Vec::new();
        let blocks = self.parse_blocks(source, &mut diagnostics);
        let source_name = filepath.display().to_string();

        let mut descriptor = CompiledDescriptor::default();
        let mut seen_script = false;

        for block in blocks {
            let line_count = block.content.split('\n').count();
            match block.kind {
                BlockKind::Script => {
                    if seen_script {
                        diagnostics.push(Diagnostic::error(
                            "a component may contain only one <script> block",
                        ));
                        continue;
                    }
                    seen_script = true;
                    let plain = block
                        .lang
                        .as_deref()
                        .map_or(true, |lang| PLAIN_SCRIPT_LANGS.contains(&lang));
                    if plain {
                        match locate_default_export(&block.content) {
                            Ok(DefaultExport::Specifier) => {
                                diagnostics.push(Diagnostic::error(UNSUPPORTED_DEFAULT_SPECIFIER))
                            }
                            Ok(_) => {}
                            Err(err) => diagnostics.push(
                                Diagnostic::error(format!("cannot scan <script> block: {err}"))
                                    .with_context(format!(
                                        "block starts at line {}",
                                        block.start_line + 1
                                    )),
                            ),
                        }
                    }
                    let map =
                        SourceMap::line_map(&source_name, source, block.start_line, line_count);
                    descriptor.script = CompiledBlock {
                        code: block.content,
                        map: Some(map),
                        lang: block.lang,
                    };
                }
                BlockKind::Style => {
                    if let Some(lang) = block.lang.as_deref().filter(|l| *l != "css") {
                        diagnostics.push(
                            Diagnostic::warning(format!(
                                "style lang=\"{lang}\" is not compiled; emitted as-is"
                            ))
                            .with_context(source_name.clone()),
                        );
                    }
                    let map =
                        SourceMap::line_map(&source_name, source, block.start_line, line_count);
                    descriptor.styles.push(CompiledBlock {
                        code: block.content,
                        map: Some(map),
                        lang: block.lang,
                    });
                }
                BlockKind::Template => {
                    if descriptor.template.is_some() {
                        diagnostics.push(Diagnostic::error(
                            "a component may contain only one top-level <template> block",
                        ));
                        continue;
                    }
                    if let Some(lang) = block.lang.as_deref().filter(|l| *l != "html") {
                        diagnostics.push(Diagnostic::warning(format!(
                            "template lang=\"{lang}\" is not compiled; emitted as-is"
                        )));
                    }
                    descriptor.template = Some(block.content);
                }
            }
        }

        if !seen_script && descriptor.template.is_none() && diagnostics.is_empty() {
            diagnostics.push(Diagnostic::warning(
                "component has neither a <template> nor a <script> block",
            ));
        }

        descriptor.diagnostics = diagnostics;
        descriptor
    }

    fn assemble(&self, filepath: &Path, descriptor: &CompiledDescriptor) -> Result<String> {
        let script = &descriptor.script.code;
        let mut out = String::with_capacity(script.len() + 256);

        let default_export = locate_default_export(script)
            .map_err(|err| PipelineError::compile(filepath, err.to_string()))?;

        match default_export {
            DefaultExport::Expression(span) => {
                out.push_str(&script[..span.start]);
                out.push_str(&format!("const {COMPONENT_BINDING} ="));
                out.push_str(&script[span.end..]);
            }
            DefaultExport::Specifier => {
                return Err(PipelineError::compile(filepath, UNSUPPORTED_DEFAULT_SPECIFIER));
            }
            DefaultExport::Missing => {
                out.push_str(script);
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&format!("const {COMPONENT_BINDING} = {{}};"));
            }
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }

        if let Some(template) = &descriptor.template {
            out.push_str(&format!(
                "{COMPONENT_BINDING}.template = `{}`;\n",
                escape_js_template_literal(template.trim())
            ));
        }

        if !descriptor.styles.is_empty() {
            out.push_str("const __sfc_styles__ = [\n");
            for style in &descriptor.styles {
                out.push_str(&format!("  \"{}\",\n", escape_js_string(&style.code)));
            }
            out.push_str("];\n");
            out.push_str(STYLE_INJECTOR);
        }

        let file_name = filepath
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        out.push_str(&format!(
            "{COMPONENT_BINDING}.__file = \"{}\";\n",
            escape_js_string(&file_name)
        ));
        out.push_str(&format!("export default {COMPONENT_BINDING};\n"));

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const COUNTER: &str = r#"<template>
  <button @click="count++">{{ count }}</button>
</template>

<script>
export default {
  data: () => ({ count: 0 })
}
</script>

<style>
button { color: red; }
</style>
"#;

    fn compile(source: &str) -> CompiledDescriptor {
        SfcCompiler::new().compile_to_descriptor(Path::new("/src/Counter.vue"), source)
    }

    #[test]
    fn splits_all_blocks() {
        let d = compile(COUNTER);
        assert!(d.diagnostics.is_empty());
        assert!(d.script.code.contains("data: () => ({ count: 0 })"));
        assert_eq!(d.styles.len(), 1);
        assert!(d.styles[0].code.contains("color: red"));
        assert!(d.template.as_deref().unwrap().contains("<button"));
    }

    #[test]
    fn script_map_points_at_block_line() {
        let d = compile(COUNTER);
        let map = d.script.map.unwrap();
        // `<script>` sits on line 5 (index 4); content begins on that line.
        assert!(map.mappings.starts_with("AAIA"));
        assert_eq!(map.sources, vec!["/src/Counter.vue"]);
    }

    #[test]
    fn reads_lang_attribute() {
        let d = compile("<script lang=\"ts\">export default {}</script><style lang='scss'>a{}</style>");
        assert_eq!(d.script.lang.as_deref(), Some("ts"));
        assert_eq!(d.styles[0].lang.as_deref(), Some("scss"));
        assert_eq!(d.diagnostics.len(), 1);
        assert!(!d.diagnostics[0].is_error());
    }

    #[test]
    fn nested_templates() {
        let d = compile(
            "<template><div><template v-if=\"ok\"><b>yes</b></template></div></template>",
        );
        assert_eq!(
            d.template.as_deref(),
            Some("<div><template v-if=\"ok\"><b>yes</b></template></div>")
        );
    }

    #[test]
    fn commented_blocks_are_skipped() {
        let d = compile("<!-- <script>export default 1</script> -->\n<script>export default 2</script>");
        assert_eq!(d.script.code, "export default 2");
    }

    #[test]
    fn missing_close_is_error() {
        let d = compile("<script>export default {}");
        assert_eq!(d.diagnostics.len(), 1);
        assert!(d.diagnostics[0].is_error());
    }

    #[test]
    fn duplicate_script_is_error() {
        let d = compile("<script>export default {}</script><script>1</script>");
        assert!(d.diagnostics.iter().any(Diagnostic::is_error));
    }

    #[test]
    fn assemble_binds_default_export() {
        let compiler = SfcCompiler::new();
        let d = compiler.compile_to_descriptor(
            Path::new("App.vue"),
            "<template><h1>`${hi}`</h1></template><script>export default { name: 'App' }</script>",
        );
        let out = compiler.assemble(Path::new("App.vue"), &d).unwrap();
        assert_eq!(
            out,
            "const __sfc__ = { name: 'App' }\n\
             __sfc__.template = `<h1>\\`\\${hi}\\`</h1>`;\n\
             __sfc__.__file = \"App.vue\";\n\
             export default __sfc__;\n"
        );
    }

    #[test]
    fn default_export_lookalikes_are_ignored() {
        let compiler = SfcCompiler::new();
        let d = compiler.compile_to_descriptor(
            Path::new("App.vue"),
            "<script>\n// export default is declared below\n\
             const note = \"export default\";\n\
             export default { name: 'App', note }\n</script>",
        );
        assert!(d.diagnostics.is_empty());
        let out = compiler.assemble(Path::new("App.vue"), &d).unwrap();
        assert_eq!(
            out,
            "\n// export default is declared below\n\
             const note = \"export default\";\n\
             const __sfc__ = { name: 'App', note }\n\
             __sfc__.__file = \"App.vue\";\n\
             export default __sfc__;\n"
        );
        let statements = out
            .lines()
            .filter(|line| line.starts_with("export default"))
            .count();
        assert_eq!(statements, 1);
    }

    #[test]
    fn default_export_after_named_exports() {
        let compiler = SfcCompiler::new();
        let d = compiler.compile_to_descriptor(
            Path::new("App.vue"),
            "<script>export const a = 1; export { a as b }; export default { a }</script>",
        );
        let out = compiler.assemble(Path::new("App.vue"), &d).unwrap();
        assert!(out.starts_with("export const a = 1; export { a as b }; const __sfc__ = { a }\n"));
    }

    #[test]
    fn default_export_specifier_is_rejected() {
        let compiler = SfcCompiler::new();
        for script in [
            "const App = {}\nexport { App as default }",
            "export { default } from './Base.js'",
        ] {
            let d = compiler.compile_to_descriptor(
                Path::new("App.vue"),
                &format!("<script>{script}</script>"),
            );
            assert_eq!(d.diagnostics.len(), 1, "{script}");
            assert!(d.diagnostics[0].is_error());
            assert!(d.diagnostics[0].message.contains("as default"));

            let err = compiler.assemble(Path::new("App.vue"), &d).unwrap_err();
            assert!(matches!(err, PipelineError::Compile { .. }));
        }
    }

    #[test]
    fn default_renamed_away_is_not_a_default_export() {
        let compiler = SfcCompiler::new();
        let d = compiler.compile_to_descriptor(
            Path::new("App.vue"),
            "<script>export { default as Base } from './Base.js'</script>",
        );
        assert!(d.diagnostics.is_empty());
        let out = compiler.assemble(Path::new("App.vue"), &d).unwrap();
        assert!(out.contains("const __sfc__ = {};"));
        assert_eq!(out.matches("export default").count(), 1);
    }

    #[test]
    fn unscannable_script_is_error() {
        let d = compile("<script>const s = 'open\nexport default {}</script>");
        assert_eq!(d.diagnostics.len(), 1);
        assert!(d.diagnostics[0].is_error());
        assert!(d.diagnostics[0].message.contains("unterminated string"));
    }

    #[test]
    fn assemble_without_script() {
        let compiler = SfcCompiler::new();
        let d = compiler.compile_to_descriptor(Path::new("Static.vue"), "<template><p/></template>");
        let out = compiler.assemble(Path::new("Static.vue"), &d).unwrap();
        assert!(out.starts_with("const __sfc__ = {};\n"));
        assert!(out.ends_with("export default __sfc__;\n"));
    }

    #[test]
    fn assemble_injects_styles() {
        let compiler = SfcCompiler::new();
        let d = compiler.compile_to_descriptor(Path::new("Counter.vue"), COUNTER);
        let out = compiler.assemble(Path::new("Counter.vue"), &d).unwrap();
        assert!(out.contains("const __sfc_styles__ = [\n  \"\\nbutton { color: red; }\\n\",\n];"));
        assert!(out.contains("document.head.appendChild(el)"));
    }
}

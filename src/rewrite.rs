//! Import specifier rewriting for plain ES modules.
//!
//! Bare package imports cannot be resolved by a browser, so
//! `import x from 'vue'` is served as `import x from '/__modules/vue'`.
//! Only static import declarations are touched; every other byte of the
//! module, quote style included, is preserved.
//!
//! The module is tokenized rather than parsed. That is enough to tell a
//! real import declaration apart from the same text inside strings,
//! comments, template literals and regular expressions.

use std::ops::Range;

use crate::plugin::ModuleRewriter;
use crate::utils::{self, VIRTUAL_MODULE_PREFIX};
use crate::{PipelineError, Result};

/// Rewrites bare import specifiers into the virtual module namespace.
#[derive(Debug, Clone)]
pub struct ImportRewriter {
    prefix: String,
}

impl Default for ImportRewriter {
    fn default() -> Self {
        Self {
            prefix: VIRTUAL_MODULE_PREFIX.to_string(),
        }
    }
}

impl ImportRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different URL namespace, e.g. `/@modules/`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl ModuleRewriter for ImportRewriter {
    fn rewrite(&self, source: &str) -> Result<String> {
        let tokens = tokenize(source)?;
        let specifiers = import_specifiers(source, &tokens);

        let mut out = String::with_capacity(source.len() + specifiers.len() * self.prefix.len());
        let mut last = 0;
        for span in specifiers {
            let specifier = &source[span.clone()];
            if !utils::is_bare_specifier(specifier) {
                continue;
            }
            out.push_str(&source[last..span.start]);
            out.push_str(&self.prefix);
            out.push_str(specifier);
            last = span.end;
        }
        out.push_str(&source[last..]);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Import declarations
// ---------------------------------------------------------------------------

/// Spans (quotes excluded) of every static import declaration's specifier.
fn import_specifiers(source: &str, tokens: &[Token]) -> Vec<Range<usize>> {
    let text = |t: &Token| &source[t.span.clone()];
    let mut specifiers = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Ident || text(token) != "import" {
            continue;
        }
        if !at_statement_start(tokens, i) {
            continue;
        }

        // `import(...)` and `import.meta` are expressions, not declarations.
        let Some(next) = tokens.get(i + 1) else {
            continue;
        };
        match next.kind {
            TokenKind::Str => {
                specifiers.push(next.span.clone());
                continue;
            }
            TokenKind::Ident | TokenKind::Punct(b'{') | TokenKind::Punct(b'*') => {}
            _ => continue,
        }

        // import <clause> from '<specifier>'
        let mut depth = 0usize;
        let mut prev_is_from = false;
        for t in &tokens[i + 1..] {
            match t.kind {
                TokenKind::Punct(b'{') => depth += 1,
                TokenKind::Punct(b'}') => depth = depth.saturating_sub(1),
                TokenKind::Str if depth == 0 => {
                    if prev_is_from {
                        specifiers.push(t.span.clone());
                    }
                    break;
                }
                TokenKind::Punct(b';') | TokenKind::Punct(b'(') => break,
                _ => {}
            }
            prev_is_from = t.kind == TokenKind::Ident && depth == 0 && text(t) == "from";
        }
    }

    specifiers
}

/// A declaration starts a statement: first token, after `;` or `}`, or on
/// a new line (automatic semicolon insertion).
pub(crate) fn at_statement_start(tokens: &[Token], i: usize) -> bool {
    let Some(prev) = i.checked_sub(1).map(|p| &tokens[p]) else {
        return true;
    };
    match prev.kind {
        TokenKind::Punct(b';') | TokenKind::Punct(b'}') => true,
        TokenKind::Punct(b'.') => false,
        _ => prev.line < tokens[i].line,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident,
    /// String literal; the span excludes the quotes.
    Str,
    Template,
    Regex,
    Number,
    Punct(u8),
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) span: Range<usize>,
    /// One-based line the token starts on.
    pub(crate) line: usize,
}

impl Token {
    /// Whether this is the identifier `word`.
    pub(crate) fn is_ident(&self, source: &str, word: &str) -> bool {
        self.kind == TokenKind::Ident && &source[self.span.clone()] == word
    }
}

/// Tokenize a module. Comments and whitespace are dropped.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).tokenize()
}

/// Keywords after which `/` starts a regular expression.
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

struct Lexer<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    /// One entry per open `{`; `true` when it was opened by `${` in a template.
    braces: Vec<bool>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            text,
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            braces: Vec::new(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        loop {
            self.skip_trivia()?;
            let Some(&c) = self.src.get(self.pos) else {
                break;
            };
            match c {
                b'\'' | b'"' => self.string(c)?,
                b'`' => {
                    let start_line = self.line;
                    self.pos += 1;
                    self.template(self.pos - 1, start_line)?;
                }
                b'/' if self.regex_allowed() => self.regex()?,
                b'{' => {
                    self.braces.push(false);
                    self.punct(c);
                }
                b'}' => {
                    if self.braces.pop() == Some(true) {
                        let start_line = self.line;
                        self.pos += 1;
                        self.template(self.pos - 1, start_line)?;
                    } else {
                        self.punct(c);
                    }
                }
                c if c.is_ascii_digit() => self.number(),
                c if is_ident_start(c) => self.ident(),
                _ => self.punct(c),
            }
        }

        if self.braces.contains(&true) {
            return Err(self.error("unterminated template literal"));
        }
        Ok(self.tokens)
    }

    fn error(&self, message: &str) -> PipelineError {
        PipelineError::Rewrite {
            line: self.line,
            message: message.to_string(),
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind, span: Range<usize>, line: usize) {
        self.tokens.push(Token { kind, span, line });
    }

    fn skip_trivia(&mut self) -> Result<()> {
        while let Some(c) = self.peek(0) {
            match c {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'/' if self.peek(1) == Some(b'/') => {
                    while let Some(c) = self.peek(0) {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    let start_line = self.line;
                    self.pos += 2;
                    loop {
                        match self.peek(0) {
                            Some(b'*') if self.peek(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(b'\n') => {
                                self.line += 1;
                                self.pos += 1;
                            }
                            Some(_) => self.pos += 1,
                            None => {
                                return Err(PipelineError::Rewrite {
                                    line: start_line,
                                    message: "unterminated block comment".into(),
                                })
                            }
                        }
                    }
                }
                c if c.is_ascii_whitespace() => self.pos += 1,
                _ => break,
            }
        }
        Ok(())
    }

    fn string(&mut self, quote: u8) -> Result<()> {
        let line = self.line;
        self.pos += 1;
        let start = self.pos;
        loop {
            match self.peek(0) {
                Some(b'\\') => {
                    if self.peek(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                Some(c) if c == quote => break,
                Some(b'\n') | None => {
                    return Err(PipelineError::Rewrite {
                        line,
                        message: "unterminated string literal".into(),
                    })
                }
                Some(_) => self.pos += 1,
            }
        }
        let end = self.pos;
        self.pos += 1;
        self.push(TokenKind::Str, start..end, line);
        Ok(())
    }

    /// Scan a template chunk starting after its opening `` ` `` or `}`.
    /// Stops at the closing backtick or at `${`.
    fn template(&mut self, start: usize, start_line: usize) -> Result<()> {
        loop {
            match self.peek(0) {
                Some(b'\\') => {
                    if self.peek(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                Some(b'`') => {
                    self.pos += 1;
                    break;
                }
                Some(b'$') if self.peek(1) == Some(b'{') => {
                    self.pos += 2;
                    self.braces.push(true);
                    break;
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
                None => {
                    return Err(PipelineError::Rewrite {
                        line: start_line,
                        message: "unterminated template literal".into(),
                    })
                }
            }
        }
        self.push(TokenKind::Template, start..self.pos, start_line);
        Ok(())
    }

    fn regex(&mut self) -> Result<()> {
        let start = self.pos;
        let line = self.line;
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.peek(0) {
                Some(b'\\') => self.pos += 2,
                Some(b'[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(b']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some(b'/') if !in_class => {
                    self.pos += 1;
                    break;
                }
                Some(b'\n') | None => {
                    return Err(PipelineError::Rewrite {
                        line,
                        message: "unterminated regular expression".into(),
                    })
                }
                Some(_) => self.pos += 1,
            }
        }
        while self.peek(0).is_some_and(is_ident_part) {
            self.pos += 1;
        }
        self.push(TokenKind::Regex, start..self.pos, line);
        Ok(())
    }

    fn number(&mut self) {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'.' || c == b'_')
        {
            self.pos += 1;
        }
        self.push(TokenKind::Number, start..self.pos, self.line);
    }

    fn ident(&mut self) {
        let start = self.pos;
        while self.peek(0).is_some_and(is_ident_part) {
            self.pos += 1;
        }
        self.push(TokenKind::Ident, start..self.pos, self.line);
    }

    fn punct(&mut self, c: u8) {
        let start = self.pos;
        self.pos += 1;
        self.push(TokenKind::Punct(c), start..self.pos, self.line);
    }

    /// Whether a `/` at the current position opens a regular expression
    /// rather than being a division operator.
    fn regex_allowed(&self) -> bool {
        let Some(prev) = self.tokens.last() else {
            return true;
        };
        match prev.kind {
            TokenKind::Ident => {
                REGEX_PRECEDING_KEYWORDS.contains(&&self.text[prev.span.clone()])
            }
            TokenKind::Number | TokenKind::Str | TokenKind::Template | TokenKind::Regex => false,
            TokenKind::Punct(b')') | TokenKind::Punct(b']') => false,
            TokenKind::Punct(_) => true,
        }
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c == b'\\' || c >= 0x80
}

fn is_ident_part(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

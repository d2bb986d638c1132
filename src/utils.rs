//! Utility functions for the pipeline.
//!
//! - Request classification and pathname decoding
//! - Bare specifier / package name checks
//! - JS string escaping (injection-safe)
//! - Base64 VLQ for source map mappings

use percent_encoding::percent_decode_str;

// ---------------------------------------------------------------------------
// Path conventions
// ---------------------------------------------------------------------------

/// Reserved URL namespace for virtual packages.
pub const VIRTUAL_MODULE_PREFIX: &str = "/__modules/";

/// Suffix of plain ES module requests.
pub const SCRIPT_SUFFIX: &str = ".js";

/// Content type of every payload the pipeline writes.
pub const JS_CONTENT_TYPE: &str = "application/javascript";

/// What a request path asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind<'a> {
    /// Single-file component source, compiled to a module.
    Component,
    /// Plain ES module, served with rewritten imports.
    Script,
    /// Virtual package under [`VIRTUAL_MODULE_PREFIX`]; carries the package name.
    VirtualModule(&'a str),
    /// Anything else. Left to the next handler.
    Unhandled,
}

/// Classify a pathname. Rules are evaluated in order; first match wins.
pub fn classify<'a>(pathname: &'a str, component_suffix: &str) -> RequestKind<'a> {
    if pathname.ends_with(component_suffix) {
        RequestKind::Component
    } else if pathname.ends_with(SCRIPT_SUFFIX) {
        RequestKind::Script
    } else if let Some(package) = pathname.strip_prefix(VIRTUAL_MODULE_PREFIX) {
        RequestKind::VirtualModule(package)
    } else {
        RequestKind::Unhandled
    }
}

/// Percent-decode a URL pathname. Invalid UTF-8 is replaced, not rejected.
pub fn decode_pathname(pathname: &str) -> String {
    percent_decode_str(pathname).decode_utf8_lossy().into_owned()
}

/// Split a raw request target into pathname and query. Fragments are dropped.
pub fn split_request_target(target: &str) -> (&str, Option<&str>) {
    let target = target.split('#').next().unwrap_or_default();
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

// ---------------------------------------------------------------------------
// Specifiers
// ---------------------------------------------------------------------------

/// Longest package name the npm registry accepts.
const MAX_PACKAGE_NAME_LEN: usize = 214;

/// Names npm reserves and never publishes.
const BLACKLISTED_NAMES: &[&str] = &["node_modules", "favicon.ico"];

/// An import specifier is rewritten only when it is not relative or
/// absolute and names a package.
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.starts_with('.') && !specifier.starts_with('/') && is_valid_package_name(specifier)
}

/// Check a name against the npm rules for new packages: lowercase,
/// URL-safe, at most 214 characters, no leading `.` or `_`, and at most
/// one `@scope/` prefix.
pub fn is_valid_package_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_PACKAGE_NAME_LEN {
        return false;
    }
    if BLACKLISTED_NAMES.contains(&name) {
        return false;
    }

    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, pkg)) => is_name_segment(scope, true) && is_name_segment(pkg, false),
            None => false,
        },
        None => is_name_segment(name, false),
    }
}

fn is_name_segment(segment: &str, is_scope: bool) -> bool {
    if segment.is_empty() {
        return false;
    }
    if !is_scope && (segment.starts_with('.') || segment.starts_with('_')) {
        return false;
    }
    segment
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'.' | b'_'))
}

// ---------------------------------------------------------------------------
// JS String Escaping
// ---------------------------------------------------------------------------

/// Escape a string for safe embedding inside a JS template literal (backtick string).
/// Prevents injection by escaping backticks, backslashes, and `${`.
pub fn escape_js_template_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '`' => out.push_str("\\`"),
            '$' if chars.peek() == Some(&'{') => {
                out.push_str("\\${");
                chars.next();
            }
            c => out.push(c),
        }
    }
    out
}

/// Escape a string for safe embedding inside a JS double-quoted string literal.
pub fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Source map VLQ
// ---------------------------------------------------------------------------

const BASE64_DIGITS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Append the base64 VLQ encoding of `value` to `out`.
pub fn encode_vlq(value: i64, out: &mut String) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };

    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64_DIGITS[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! URI templates and the rooted filesystem resource handler.
//!
//! Templates implement RFC 6570 level 1 (`{name}`, one path segment) plus
//! the reserved form `{+name}` whose expansion may span `/`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::model::{ErrorData, ReadResourceResult, ResourceContents};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    /// `{name}`: matches within one path segment.
    Simple(String),
    /// `{+name}`: reserved expansion, slashes allowed.
    Reserved(String),
}

/// A parsed URI template.
#[derive(Debug, Clone, PartialEq)]
pub struct UriTemplate {
    segments: Vec<Segment>,
}

impl UriTemplate {
    pub fn parse(template: &str) -> Result<Self, ErrorData> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed || name.is_empty() {
                        return Err(ErrorData::invalid_params(
                            format!("malformed uri template: {template}"),
                            None,
                        ));
                    }
                    let segment = match name.strip_prefix('+') {
                        Some(rest) => Segment::Reserved(rest.to_string()),
                        None => Segment::Simple(name),
                    };
                    if !matches!(segments.last(), None | Some(Segment::Literal(_))) {
                        return Err(ErrorData::invalid_params(
                            format!("uri template has adjacent expressions: {template}"),
                            None,
                        ));
                    }
                    segments.push(segment);
                }
                '}' => {
                    return Err(ErrorData::invalid_params(
                        format!("malformed uri template: {template}"),
                        None,
                    ));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Match a concrete URI, yielding the variable bindings.
    pub fn matches(&self, uri: &str) -> Option<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        let mut rest = uri;
        let mut i = 0;
        while i < self.segments.len() {
            match &self.segments[i] {
                Segment::Literal(lit) => {
                    rest = rest.strip_prefix(lit.as_str())?;
                    i += 1;
                }
                variable => {
                    let allow_slash = matches!(variable, Segment::Reserved(_));
                    let name = match variable {
                        Segment::Simple(name) | Segment::Reserved(name) => name.clone(),
                        Segment::Literal(_) => unreachable!(),
                    };
                    // the span runs to the next literal, or to the end
                    let value = match self.segments.get(i + 1) {
                        None => {
                            let value = rest;
                            rest = "";
                            value
                        }
                        Some(Segment::Literal(next)) => {
                            let at = if allow_slash {
                                rest.rfind(next.as_str())?
                            } else {
                                rest.find(next.as_str())?
                            };
                            let (value, tail) = rest.split_at(at);
                            rest = tail;
                            value
                        }
                        // parse() refuses adjacent expressions
                        Some(_) => return None,
                    };
                    if !allow_slash && value.contains('/') {
                        return None;
                    }
                    vars.insert(name, percent_decode(value));
                    i += 1;
                }
            }
        }
        rest.is_empty().then_some(vars)
    }

    /// Expand the template with the given variables. Missing variables
    /// expand to the empty string, as RFC 6570 prescribes.
    pub fn expand(&self, vars: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Simple(name) => {
                    if let Some(value) = vars.get(name) {
                        out.push_str(&percent_encode(value, false));
                    }
                }
                Segment::Reserved(name) => {
                    if let Some(value) = vars.get(name) {
                        out.push_str(&percent_encode(value, true));
                    }
                }
            }
        }
        out
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

fn percent_encode(value: &str, reserved: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        let keep = is_unreserved(byte)
            || (reserved
                && matches!(
                    byte,
                    b'/' | b':' | b'?' | b'#' | b'[' | b']' | b'@' | b'!' | b'$' | b'&' | b'\''
                        | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=' | b'%'
                ));
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Serves `file:///` URIs from a configured root directory. A path that
/// escapes the root after canonicalisation is reported as a missing
/// resource.
#[derive(Debug, Clone)]
pub struct FileResourceHandler {
    root: PathBuf,
}

impl FileResourceHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn read(&self, uri: &str) -> Result<ReadResourceResult, ErrorData> {
        let not_found = || ErrorData::resource_not_found(format!("resource not found: {uri}"), None);
        let path = uri
            .strip_prefix("file://")
            .filter(|p| p.starts_with('/'))
            .ok_or_else(not_found)?;
        let relative = percent_decode(path.trim_start_matches('/'));
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| not_found())?;
        let candidate = tokio::fs::canonicalize(root.join(&relative))
            .await
            .map_err(|_| not_found())?;
        if !candidate.starts_with(&root) {
            return Err(not_found());
        }
        let bytes = tokio::fs::read(&candidate).await.map_err(|_| not_found())?;
        let contents = match String::from_utf8(bytes) {
            Ok(text) => ResourceContents::Text {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text,
            },
            Err(not_text) => ResourceContents::Blob {
                uri: uri.to_string(),
                mime_type: Some("application/octet-stream".to_string()),
                blob: STANDARD.encode(not_text.into_bytes()),
            },
        };
        Ok(ReadResourceResult {
            contents: vec![contents],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_variable_matches_one_segment() {
        let template = UriTemplate::parse("db://{db}/{table}").expect("parses");
        let vars = template.matches("db://main/users").expect("matches");
        assert_eq!(vars["db"], "main");
        assert_eq!(vars["table"], "users");
        assert!(template.matches("db://main/users/extra").is_none());
    }

    #[test]
    fn reserved_variable_spans_slashes() {
        let template = UriTemplate::parse("file:///{+path}").expect("parses");
        let vars = template.matches("file:///docs/a/b.txt").expect("matches");
        assert_eq!(vars["path"], "docs/a/b.txt");
    }

    #[test]
    fn reserved_variable_with_trailing_literal_is_greedy() {
        let template = UriTemplate::parse("file:///{+path}.txt").expect("parses");
        let vars = template.matches("file:///a/b.txt").expect("matches");
        assert_eq!(vars["path"], "a/b");
    }

    #[test]
    fn adjacent_expressions_are_rejected() {
        assert!(UriTemplate::parse("x://{a}{b}").is_err());
        assert!(UriTemplate::parse("x://{unclosed").is_err());
    }

    #[test]
    fn expansion_round_trips_simple_values() {
        let template = UriTemplate::parse("db://{db}/{table}").expect("parses");
        let vars = BTreeMap::from([
            ("db".to_string(), "main".to_string()),
            ("table".to_string(), "user records".to_string()),
        ]);
        assert_eq!(template.expand(&vars), "db://main/user%20records");
    }

    #[test]
    fn percent_decoding_applies_to_matches() {
        let template = UriTemplate::parse("db://{db}").expect("parses");
        let vars = template.matches("db://user%20records").expect("matches");
        assert_eq!(vars["db"], "user records");
    }

    #[tokio::test]
    async fn file_handler_refuses_escapes() {
        let dir = std::env::temp_dir().join(format!("mcpkit-res-{}", std::process::id()));
        tokio::fs::create_dir_all(dir.join("sub")).await.expect("mkdir");
        tokio::fs::write(dir.join("sub/inside.txt"), "inside")
            .await
            .expect("write");
        tokio::fs::write(dir.join("outside.txt"), "outside")
            .await
            .expect("write");
        let handler = FileResourceHandler::new(dir.join("sub"));

        let ok = handler.read("file:///inside.txt").await.expect("readable");
        assert_eq!(ok.contents.len(), 1);

        // exists on disk but escapes the configured root
        let escape = handler.read("file:///../outside.txt").await;
        assert!(escape.is_err());
        let missing = handler.read("file:///nope.txt").await;
        assert!(missing.is_err());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

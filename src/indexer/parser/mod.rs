// Language extractors and the registry that dispatches files to them

mod go;
mod java;
mod javascript;
mod python;
mod rust_lang;
mod schema;
mod template;

pub use go::GoExtractor;
pub use java::JavaExtractor;
pub use javascript::{JsDialect, JavaScriptExtractor};
pub use python::PythonExtractor;
pub use rust_lang::RustExtractor;
pub use schema::SchemaExtractor;
pub use template::TemplateExtractor;

use std::collections::BTreeSet;
use std::path::Path;
use tree_sitter::{Language, Node, Parser as TreeParser, Tree};

use crate::error::{AtlasError, Result};
use crate::index::{Modifier, Param, RelationshipKind, SymbolKind};

/// Structural extractor for one language family.
///
/// Implementations are stateless; a single instance is shared by all workers.
pub trait Extractor: Send + Sync {
    /// Language tag stored with every symbol.
    fn language(&self) -> &'static str;

    /// File extensions (lowercase, without dot) this extractor may claim.
    fn extensions(&self) -> &'static [&'static str];

    /// Whether this extractor handles `path`. `content` is available for
    /// sniffing ambiguous formats.
    fn applies_to(&self, path: &str, _content: &str) -> bool {
        extension_of(path)
            .map(|ext| self.extensions().contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Extract symbol and reference drafts. Syntax errors yield a partial
    /// extraction, not an error.
    fn extract(&self, path: &str, content: &str) -> Result<Extraction>;
}

/// Raw extractor output for one file.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub symbols: Vec<SymbolDraft>,
    pub references: Vec<ReferenceDraft>,
    /// Set when the file had syntax errors and only part of it was recovered.
    pub partial: Option<String>,
}

impl Extraction {
    pub fn push(&mut self, symbol: SymbolDraft) {
        self.symbols.push(symbol);
    }

    pub fn reference(
        &mut self,
        from: Option<&str>,
        target: impl Into<String>,
        kind: RelationshipKind,
        line: u32,
    ) {
        let target = target.into();
        if target.is_empty() {
            return;
        }
        self.references.push(ReferenceDraft {
            from: from.map(str::to_string),
            target,
            kind,
            line,
        });
    }
}

/// A symbol as seen by an extractor, before ids and tiers exist.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDraft {
    pub kind: SymbolKind,
    pub name: String,
    pub qualified_name: String,
    /// Qualified name of the enclosing symbol.
    pub parent: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
    pub params: Vec<Param>,
    pub return_type: Option<String>,
    pub modifiers: BTreeSet<Modifier>,
    pub decorators: Vec<String>,
    pub doc: Option<String>,
}

impl SymbolDraft {
    pub fn new(
        kind: SymbolKind,
        name: impl Into<String>,
        qualified_name: impl Into<String>,
        start_line: u32,
        end_line: u32,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            qualified_name: qualified_name.into(),
            parent: None,
            start_line,
            end_line,
            params: Vec::new(),
            return_type: None,
            modifiers: BTreeSet::new(),
            decorators: Vec::new(),
            doc: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<&str>) -> Self {
        self.parent = parent.map(str::to_string);
        self
    }

    pub fn with_modifier(mut self, modifier: Modifier, present: bool) -> Self {
        if present {
            self.modifiers.insert(modifier);
        }
        self
    }
}

/// A name-based reference from the enclosing symbol to some target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDraft {
    /// Qualified name of the referring symbol; None at module level.
    pub from: Option<String>,
    pub target: String,
    pub kind: RelationshipKind,
    pub line: u32,
}

/// Dispatches files to extractors by extension and content sniffing.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// Registry with every built-in language.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PythonExtractor));
        registry.register(Box::new(JavaScriptExtractor::new(JsDialect::JavaScript)));
        registry.register(Box::new(JavaScriptExtractor::new(JsDialect::TypeScript)));
        registry.register(Box::new(JavaScriptExtractor::new(JsDialect::Tsx)));
        registry.register(Box::new(RustExtractor));
        registry.register(Box::new(GoExtractor));
        registry.register(Box::new(JavaExtractor));
        registry.register(Box::new(TemplateExtractor));
        registry.register(Box::new(SchemaExtractor));
        registry
    }

    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    /// Cheap eligibility check used during enumeration.
    pub fn is_candidate(&self, path: &str) -> bool {
        match extension_of(path) {
            Some(ext) => self
                .extractors
                .iter()
                .any(|e| e.extensions().contains(&ext.as_str())),
            None => false,
        }
    }

    /// First extractor that claims the file.
    pub fn select(&self, path: &str, content: &str) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.applies_to(path, content))
            .map(|e| e.as_ref())
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Whether a path looks like a test file in any supported ecosystem.
pub fn is_test_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);

    normalized.starts_with("tests/")
        || normalized.starts_with("test/")
        || normalized.contains("/tests/")
        || normalized.contains("/test/")
        || normalized.contains("/__tests__/")
        || (file_name.starts_with("test_") && file_name.ends_with(".py"))
        || file_name.ends_with("_test.py")
        || file_name.ends_with("_test.go")
        || [".test.", ".spec."].iter().any(|m| file_name.contains(m))
}

/// Whether a symbol name follows a test naming convention.
pub fn is_test_name(name: &str) -> bool {
    name.starts_with("test_")
        || name
            .strip_prefix("Test")
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_uppercase() || c == '_')
}

// Shared tree-sitter plumbing

pub(crate) fn parse_tree(language: Language, content: &str, path: &str) -> Result<Tree> {
    let mut parser = TreeParser::new();
    parser
        .set_language(&language)
        .map_err(|e| AtlasError::Extraction {
            path: path.to_string(),
            message: format!("grammar load failed: {}", e),
        })?;

    parser
        .parse(content, None)
        .ok_or_else(|| AtlasError::Extraction {
            path: path.to_string(),
            message: "parser produced no tree".to_string(),
        })
}

/// Marker for trees that contain error nodes.
pub(crate) fn partial_marker(tree: &Tree) -> Option<String> {
    if tree.root_node().has_error() {
        Some("syntax errors; partial structure recovered".to_string())
    } else {
        None
    }
}

pub(crate) fn text<'a>(node: Node, src: &'a str) -> &'a str {
    src.get(node.byte_range()).unwrap_or("")
}

pub(crate) fn field_text<'a>(node: Node, field: &str, src: &'a str) -> Option<&'a str> {
    node.child_by_field_name(field)
        .map(|n| text(n, src))
        .filter(|t| !t.is_empty())
}

/// 1-based inclusive line range.
pub(crate) fn lines(node: Node) -> (u32, u32) {
    (
        node.start_position().row as u32 + 1,
        node.end_position().row as u32 + 1,
    )
}

pub(crate) fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

pub(crate) fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

pub(crate) fn has_child_kind(node: Node, kind: &str) -> bool {
    children(node).iter().any(|c| c.kind() == kind)
}

/// Named descendants matching `pred`, in document order. Subtrees rooted at
/// a `skip` kind are not entered.
pub(crate) fn collect_descendants<'t>(
    node: Node<'t>,
    skip: &[&str],
    pred: impl Fn(Node<'t>) -> bool,
) -> Vec<Node<'t>> {
    let mut found = Vec::new();
    let mut stack = named_children(node);
    stack.reverse();
    while let Some(current) = stack.pop() {
        if pred(current) {
            found.push(current);
        }
        if skip.contains(&current.kind()) {
            continue;
        }
        let mut kids = named_children(current);
        kids.reverse();
        stack.extend(kids);
    }
    found
}

/// Join a scope prefix and a name with `sep`.
pub(crate) fn qualify(scope: Option<&str>, name: &str, sep: &str) -> String {
    match scope {
        Some(prefix) if !prefix.is_empty() => format!("{}{}{}", prefix, sep, name),
        _ => name.to_string(),
    }
}

/// Last segment of a dotted or path-like name: `a.b.C` and `a::b::C` give `C`.
pub(crate) fn last_segment(name: &str) -> &str {
    name.rsplit(|c: char| matches!(c, '.' | ':' | '/' | '\\'))
        .find(|s| !s.is_empty())
        .unwrap_or(name)
}

/// Text of consecutive line comments immediately above `node`, with the
/// given prefix stripped.
pub(crate) fn leading_comments(node: Node, src: &str, prefixes: &[&str]) -> Option<String> {
    let mut lines = Vec::new();
    let mut expected_row = node.start_position().row;
    let mut current = node.prev_sibling();

    while let Some(prev) = current {
        if !prev.kind().contains("comment") || prev.end_position().row + 1 != expected_row {
            break;
        }
        let raw = text(prev, src).trim();
        let Some(body) = prefixes.iter().find_map(|p| raw.strip_prefix(p)) else {
            break;
        };
        lines.push(body.trim().to_string());
        expected_row = prev.start_position().row;
        current = prev.prev_sibling();
    }

    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    Some(lines.join("\n"))
}

/// Strip `/** ... */` decoration from a block doc comment.
pub(crate) fn clean_block_comment(raw: &str) -> String {
    let inner = raw
        .trim()
        .trim_start_matches("/**")
        .trim_start_matches("/*")
        .trim_end_matches("*/");
    inner
        .lines()
        .map(|l| l.trim().trim_start_matches('*').trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Block doc comment (`/** */`) directly above `node`, if any.
pub(crate) fn block_doc_above(node: Node, src: &str) -> Option<String> {
    let prev = node.prev_sibling()?;
    if !prev.kind().contains("comment") || prev.end_position().row + 1 < node.start_position().row {
        return None;
    }
    let raw = text(prev, src);
    if raw.starts_with("/**") {
        Some(clean_block_comment(raw))
    } else {
        None
    }
}

/// Collapse whitespace runs so multi-line annotations stay one-line.
pub(crate) fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_dispatch_by_extension() {
        let registry = ExtractorRegistry::with_defaults();
        let lang = |path: &str| registry.select(path, "").map(|e| e.language());

        assert_eq!(lang("app/models.py"), Some("python"));
        assert_eq!(lang("web/App.jsx"), Some("javascript"));
        assert_eq!(lang("web/api.ts"), Some("typescript"));
        assert_eq!(lang("web/App.tsx"), Some("tsx"));
        assert_eq!(lang("src/lib.rs"), Some("rust"));
        assert_eq!(lang("cmd/main.go"), Some("go"));
        assert_eq!(lang("src/Main.java"), Some("java"));
        assert_eq!(lang("db/schema.prisma"), Some("schema"));
        assert_eq!(lang("README.md"), None);
    }

    #[test]
    fn test_html_claimed_only_with_template_syntax() {
        let registry = ExtractorRegistry::with_defaults();
        assert!(registry.is_candidate("templates/base.html"));
        assert!(registry.select("static/plain.html", "<p>hello</p>").is_none());
        assert_eq!(
            registry
                .select("templates/base.html", "{% block content %}{% endblock %}")
                .map(|e| e.language()),
            Some("template")
        );
    }

    #[test]
    fn test_test_path_detection() {
        assert!(is_test_path("tests/test_auth.py"));
        assert!(is_test_path("pkg/auth/login_test.go"));
        assert!(is_test_path("web/Button.test.tsx"));
        assert!(is_test_path("web/__tests__/Button.jsx"));
        assert!(!is_test_path("src/auth.py"));
        assert!(!is_test_path("src/contest.py"));
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("a.b.C"), "C");
        assert_eq!(last_segment("std::fmt::Display"), "Display");
        assert_eq!(last_segment("plain"), "plain");
    }

    #[test]
    fn test_clean_block_comment() {
        let raw = "/**\n * Loads the user.\n * @param id the id\n */";
        assert_eq!(clean_block_comment(raw), "Loads the user.\n@param id the id");
    }
}

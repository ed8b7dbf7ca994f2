use tree_sitter::Node;

use super::{
    field_text, has_child_kind, is_test_path, last_segment, lines, named_children, one_line,
    parse_tree, partial_marker, qualify, text, Extraction, Extractor, SymbolDraft,
};
use crate::error::Result;
use crate::index::{Modifier, Param, RelationshipKind, SymbolKind};

/// Rust extractor using tree-sitter
pub struct RustExtractor;

impl Extractor for RustExtractor {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let tree = parse_tree(tree_sitter_rust::LANGUAGE.into(), content, path)?;
        let mut walker = Walker {
            src: content,
            out: Extraction {
                partial: partial_marker(&tree),
                ..Default::default()
            },
        };
        let root = Frame {
            qualified: String::new(),
            kind: SymbolKind::Module,
            test: is_test_path(path),
        };
        walker.items(tree.root_node(), &root);
        Ok(walker.out)
    }
}

#[derive(Debug, Clone)]
struct Frame {
    /// Empty at file level.
    qualified: String,
    kind: SymbolKind,
    test: bool,
}

impl Frame {
    fn scope(&self) -> Option<&str> {
        (!self.qualified.is_empty()).then_some(self.qualified.as_str())
    }
}

/// Attributes and `///` docs attached to an item.
#[derive(Default)]
struct Preamble {
    attributes: Vec<String>,
    doc: Option<String>,
    start_line: Option<u32>,
}

impl Preamble {
    fn has(&self, attr: &str) -> bool {
        self.attributes.iter().any(|a| a == attr || a.ends_with(&format!("::{}", attr)))
    }
}

struct Walker<'a> {
    src: &'a str,
    out: Extraction,
}

impl<'a> Walker<'a> {
    fn items(&mut self, container: Node, frame: &Frame) {
        for item in named_children(container) {
            self.item(item, frame);
        }
    }

    fn item(&mut self, node: Node, frame: &Frame) {
        match node.kind() {
            "function_item" | "function_signature_item" => self.function(node, frame),
            "struct_item" | "enum_item" | "union_item" => {
                self.type_item(node, frame, SymbolKind::Struct)
            }
            "trait_item" => self.trait_item(node, frame),
            "impl_item" => self.impl_item(node, frame),
            "mod_item" => self.module(node, frame),
            "const_item" | "static_item" => self.constant(node, frame),
            "use_declaration" => self.use_declaration(node, frame),
            _ => self.calls(node, frame),
        }
    }

    fn function(&mut self, node: Node, frame: &Frame) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let pre = self.preamble(node);
        let qualified = qualify(frame.scope(), name, "::");
        let (start, end) = lines(node);
        let kind = if matches!(frame.kind, SymbolKind::Struct | SymbolKind::Interface) {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };
        let fn_modifiers = named_children(node)
            .into_iter()
            .find(|c| c.kind() == "function_modifiers");

        let mut draft = SymbolDraft::new(kind, name, qualified.clone(), pre.start_line.unwrap_or(start), end)
            .with_parent(frame.scope())
            .with_modifier(Modifier::Exported, is_pub(node, self.src))
            .with_modifier(
                Modifier::Async,
                fn_modifiers.map(|m| has_child_kind(m, "async")).unwrap_or(false),
            )
            .with_modifier(Modifier::Test, frame.test || pre.has("test"))
            .with_modifier(
                Modifier::Static,
                kind == SymbolKind::Method && !takes_self(node),
            )
            .with_modifier(Modifier::Abstract, node.kind() == "function_signature_item");
        draft.params = self.parameters(node);
        draft.return_type = field_text(node, "return_type", self.src).map(one_line);
        draft.doc = pre.doc.clone();
        draft.decorators = pre.attributes;
        self.out.push(draft);

        if let Some(body) = node.child_by_field_name("body") {
            let inner = Frame {
                qualified,
                kind,
                test: frame.test,
            };
            self.items(body, &inner);
        }
    }

    fn type_item(&mut self, node: Node, frame: &Frame, kind: SymbolKind) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let pre = self.preamble(node);
        let (start, end) = lines(node);
        let mut draft = SymbolDraft::new(
            kind,
            name,
            qualify(frame.scope(), name, "::"),
            pre.start_line.unwrap_or(start),
            end,
        )
        .with_parent(frame.scope())
        .with_modifier(Modifier::Exported, is_pub(node, self.src))
        .with_modifier(Modifier::Test, frame.test);
        draft.doc = pre.doc;
        draft.decorators = pre.attributes;
        self.out.push(draft);
    }

    fn trait_item(&mut self, node: Node, frame: &Frame) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let qualified = qualify(frame.scope(), name, "::");
        self.type_item(node, frame, SymbolKind::Interface);

        if let Some(bounds) = node.child_by_field_name("bounds") {
            for bound in named_children(bounds) {
                let target = type_name(text(bound, self.src));
                self.out
                    .reference(Some(&qualified), target, RelationshipKind::Extends, lines(bound).0);
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            let inner = Frame {
                qualified,
                kind: SymbolKind::Interface,
                test: frame.test,
            };
            self.items(body, &inner);
        }
    }

    /// Methods attach to the implementing type; the impl block itself is not a symbol.
    fn impl_item(&mut self, node: Node, frame: &Frame) {
        let Some(self_type) = field_text(node, "type", self.src) else {
            return;
        };
        let owner = qualify(frame.scope(), &type_name(self_type), "::");

        if let Some(trait_name) = field_text(node, "trait", self.src) {
            self.out.reference(
                Some(&owner),
                type_name(trait_name),
                RelationshipKind::Implements,
                lines(node).0,
            );
        }

        if let Some(body) = node.child_by_field_name("body") {
            let inner = Frame {
                qualified: owner,
                kind: SymbolKind::Struct,
                test: frame.test,
            };
            self.items(body, &inner);
        }
    }

    fn module(&mut self, node: Node, frame: &Frame) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let pre = self.preamble(node);
        let qualified = qualify(frame.scope(), name, "::");
        let test = frame.test || pre.attributes.iter().any(|a| a == "cfg(test)");
        let (start, end) = lines(node);

        let mut draft = SymbolDraft::new(
            SymbolKind::Module,
            name,
            qualified.clone(),
            pre.start_line.unwrap_or(start),
            end,
        )
        .with_parent(frame.scope())
        .with_modifier(Modifier::Exported, is_pub(node, self.src))
        .with_modifier(Modifier::Test, test);
        draft.doc = pre.doc;
        self.out.push(draft);

        // `mod foo;` declares a file-backed module
        match node.child_by_field_name("body") {
            Some(body) => {
                let inner = Frame {
                    qualified,
                    kind: SymbolKind::Module,
                    test,
                };
                self.items(body, &inner);
            }
            None => self.out.reference(
                Some(&qualified),
                name,
                RelationshipKind::Imports,
                start,
            ),
        }
    }

    fn constant(&mut self, node: Node, frame: &Frame) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let pre = self.preamble(node);
        let (start, end) = lines(node);
        let mut draft = SymbolDraft::new(
            SymbolKind::Constant,
            name,
            qualify(frame.scope(), name, "::"),
            pre.start_line.unwrap_or(start),
            end,
        )
        .with_parent(frame.scope())
        .with_modifier(Modifier::Exported, is_pub(node, self.src))
        .with_modifier(Modifier::Static, node.kind() == "static_item")
        .with_modifier(Modifier::Test, frame.test);
        draft.return_type = field_text(node, "type", self.src).map(one_line);
        draft.doc = pre.doc;
        self.out.push(draft);

        if let Some(value) = node.child_by_field_name("value") {
            self.calls(value, frame);
        }
    }

    fn use_declaration(&mut self, node: Node, frame: &Frame) {
        let Some(argument) = field_text(node, "argument", self.src) else {
            return;
        };
        let path = one_line(argument);
        let (start, end) = lines(node);
        self.out.push(
            SymbolDraft::new(SymbolKind::Import, path.clone(), path.clone(), start, end)
                .with_parent(frame.scope())
                .with_modifier(Modifier::Exported, is_pub(node, self.src)),
        );
        self.out
            .reference(Some(&path), path.clone(), RelationshipKind::Imports, start);
    }

    /// Call edges anywhere below `node`, attributed to the enclosing frame.
    fn calls(&mut self, node: Node, frame: &Frame) {
        if node.kind() == "call_expression" {
            if let Some(function) = node.child_by_field_name("function") {
                let target = match function.kind() {
                    "identifier" => Some(text(function, self.src)),
                    "field_expression" => field_text(function, "field", self.src),
                    "scoped_identifier" => field_text(function, "name", self.src),
                    _ => None,
                };
                if let Some(target) = target {
                    self.out
                        .reference(frame.scope(), target, RelationshipKind::Calls, lines(node).0);
                }
            }
        }

        for child in named_children(node) {
            match child.kind() {
                // Nested items are their own symbols
                "function_item" | "struct_item" | "enum_item" | "impl_item" | "trait_item"
                | "mod_item" | "const_item" | "static_item" | "use_declaration" => {
                    self.item(child, frame)
                }
                _ => self.calls(child, frame),
            }
        }
    }

    fn parameters(&self, node: Node) -> Vec<Param> {
        let Some(list) = node.child_by_field_name("parameters") else {
            return Vec::new();
        };
        named_children(list)
            .into_iter()
            .filter(|p| p.kind() == "parameter")
            .filter_map(|p| {
                let name = field_text(p, "pattern", self.src)?;
                Some(Param::new(
                    one_line(name),
                    field_text(p, "type", self.src).map(one_line),
                ))
            })
            .collect()
    }

    /// Walk back over attributes and `///` comments directly above `node`.
    fn preamble(&self, node: Node) -> Preamble {
        let mut pre = Preamble::default();
        let mut docs = Vec::new();
        let mut current = node.prev_sibling();

        while let Some(prev) = current {
            match prev.kind() {
                "attribute_item" => {
                    let raw = text(prev, self.src).trim();
                    let inner = raw
                        .trim_start_matches("#[")
                        .trim_end_matches(']')
                        .trim();
                    pre.attributes.push(one_line(inner));
                }
                "line_comment" => {
                    let raw = text(prev, self.src).trim();
                    match raw.strip_prefix("///") {
                        Some(body) if !raw.starts_with("////") => docs.push(body.trim().to_string()),
                        _ => break,
                    }
                }
                _ => break,
            }
            pre.start_line = Some(lines(prev).0);
            current = prev.prev_sibling();
        }

        pre.attributes.reverse();
        docs.reverse();
        if !docs.is_empty() {
            pre.doc = Some(docs.join("\n").trim().to_string());
        }
        pre
    }
}

fn is_pub(node: Node, src: &str) -> bool {
    named_children(node)
        .iter()
        .any(|c| c.kind() == "visibility_modifier" && text(*c, src).trim() == "pub")
}

fn takes_self(node: Node) -> bool {
    node.child_by_field_name("parameters")
        .map(|p| named_children(p).iter().any(|c| c.kind() == "self_parameter"))
        .unwrap_or(false)
}

/// `crate::store::Cache<K, V>` gives `Cache`.
fn type_name(raw: &str) -> String {
    let without_generics = raw.split('<').next().unwrap_or(raw).trim();
    let without_refs = without_generics.trim_start_matches(['&', ' ']);
    last_segment(without_refs).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = r#"use std::collections::HashMap;
use crate::store::{Cache, Entry};

mod codec;

/// Maximum entries kept in memory.
pub const MAX_ENTRIES: usize = 1024;

/// A bounded cache.
///
/// Evicts the oldest entry first.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    map: HashMap<K, V>,
}

pub trait Evict: Send {
    fn evict(&mut self) -> Option<usize>;
}

impl<K, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { map: HashMap::with_capacity(capacity) }
    }

    pub async fn get(&self, key: &K) -> Option<&V> {
        self.touch(key);
        self.map.get(key)
    }
}

impl<K, V> Evict for LruCache<K, V> {
    fn evict(&mut self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn evicts_oldest() {
        let cache = super::LruCache::new(2);
    }
}
"#;

    fn extract() -> Extraction {
        RustExtractor.extract("src/cache.rs", SOURCE).unwrap()
    }

    fn find<'e>(out: &'e Extraction, qualified: &str) -> &'e SymbolDraft {
        out.symbols
            .iter()
            .find(|s| s.qualified_name == qualified)
            .unwrap_or_else(|| panic!("missing {}", qualified))
    }

    #[test]
    fn test_items_and_docs() {
        let out = extract();
        assert!(out.partial.is_none());

        let cache = find(&out, "LruCache");
        assert_eq!(cache.kind, SymbolKind::Struct);
        assert!(cache.modifiers.contains(&Modifier::Exported));
        assert_eq!(cache.start_line, 9);
        assert_eq!(cache.decorators, vec!["derive(Debug, Clone)".to_string()]);
        assert_eq!(
            cache.doc.as_deref(),
            Some("A bounded cache.\n\nEvicts the oldest entry first.")
        );

        let constant = find(&out, "MAX_ENTRIES");
        assert_eq!(constant.kind, SymbolKind::Constant);
        assert_eq!(constant.return_type.as_deref(), Some("usize"));

        assert_eq!(find(&out, "Evict").kind, SymbolKind::Interface);
        assert!(find(&out, "Evict::evict").modifiers.contains(&Modifier::Abstract));
    }

    #[test]
    fn test_impl_methods_attach_to_type() {
        let out = extract();

        let new = find(&out, "LruCache::new");
        assert_eq!(new.kind, SymbolKind::Method);
        assert_eq!(new.parent.as_deref(), Some("LruCache"));
        assert!(new.modifiers.contains(&Modifier::Static));
        assert_eq!(new.params, vec![Param::new("capacity", Some("usize".to_string()))]);
        assert_eq!(new.return_type.as_deref(), Some("Self"));

        let get = find(&out, "LruCache::get");
        assert!(get.modifiers.contains(&Modifier::Async));
        assert!(!get.modifiers.contains(&Modifier::Static));

        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Implements
            && r.from.as_deref() == Some("LruCache")
            && r.target == "Evict"));
        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Extends
            && r.from.as_deref() == Some("Evict")
            && r.target == "Send"));
        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Calls
            && r.from.as_deref() == Some("LruCache::get")
            && r.target == "touch"));
        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Calls
            && r.from.as_deref() == Some("LruCache::new")
            && r.target == "with_capacity"));
    }

    #[test]
    fn test_uses_and_test_modules() {
        let out = extract();

        let imports: Vec<_> = out
            .references
            .iter()
            .filter(|r| r.kind == RelationshipKind::Imports)
            .map(|r| r.target.as_str())
            .collect();
        assert_eq!(
            imports,
            vec!["std::collections::HashMap", "crate::store::{Cache, Entry}", "codec"]
        );

        let test_fn = find(&out, "tests::evicts_oldest");
        assert!(test_fn.modifiers.contains(&Modifier::Test));
        assert!(find(&out, "tests").modifiers.contains(&Modifier::Test));
        assert!(!find(&out, "LruCache::new").modifiers.contains(&Modifier::Test));
    }
}

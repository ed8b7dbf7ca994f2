use tree_sitter::Node;

use super::{
    block_doc_above, children, field_text, is_test_path, last_segment, lines, named_children,
    one_line, parse_tree, partial_marker, qualify, text, Extraction, Extractor, SymbolDraft,
};
use crate::error::Result;
use crate::index::{Modifier, Param, RelationshipKind, SymbolKind};

/// Java extractor using tree-sitter
pub struct JavaExtractor;

impl Extractor for JavaExtractor {
    fn language(&self) -> &'static str {
        "java"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["java"]
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let tree = parse_tree(tree_sitter_java::LANGUAGE.into(), content, path)?;
        let mut walker = Walker {
            src: content,
            test_file: is_test_path(path) || path.contains("src/test/"),
            out: Extraction {
                partial: partial_marker(&tree),
                ..Default::default()
            },
        };
        walker.members(tree.root_node(), None);
        Ok(walker.out)
    }
}

#[derive(Debug, Clone)]
struct Owner {
    qualified: String,
    interface: bool,
}

/// Keywords and annotations from a `modifiers` node.
#[derive(Default)]
struct Modifiers {
    keywords: Vec<String>,
    annotations: Vec<String>,
}

impl Modifiers {
    fn has(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|k| k == keyword)
    }
}

struct Walker<'a> {
    src: &'a str,
    test_file: bool,
    out: Extraction,
}

impl<'a> Walker<'a> {
    fn members(&mut self, container: Node, owner: Option<&Owner>) {
        for node in named_children(container) {
            match node.kind() {
                "class_declaration" | "record_declaration" => self.type_decl(node, owner, SymbolKind::Class),
                "interface_declaration" | "annotation_type_declaration" => {
                    self.type_decl(node, owner, SymbolKind::Interface)
                }
                "enum_declaration" => self.type_decl(node, owner, SymbolKind::Struct),
                "method_declaration" | "constructor_declaration" => self.method(node, owner),
                "field_declaration" | "constant_declaration" => self.field(node, owner),
                "import_declaration" => self.import(node),
                // Enum constants precede the regular members
                "enum_body_declarations" => self.members(node, owner),
                _ => {}
            }
        }
    }

    fn type_decl(&mut self, node: Node, owner: Option<&Owner>, kind: SymbolKind) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let parent = owner.map(|o| o.qualified.as_str());
        let qualified = qualify(parent, name, ".");
        let mods = self.modifiers(node);
        let (start, end) = lines(node);

        let mut draft = SymbolDraft::new(kind, name, qualified.clone(), start, end)
            .with_parent(parent)
            .with_modifier(Modifier::Exported, mods.has("public"))
            .with_modifier(Modifier::Static, mods.has("static"))
            .with_modifier(Modifier::Abstract, mods.has("abstract"))
            .with_modifier(Modifier::Test, self.test_file);
        draft.doc = block_doc_above(node, self.src);
        draft.decorators = mods.annotations;
        self.out.push(draft);

        if let Some(superclass) = node.child_by_field_name("superclass") {
            for target in named_children(superclass) {
                self.type_reference(&qualified, target, RelationshipKind::Extends);
            }
        }
        // Interfaces extend, classes and enums implement
        let (field, rel) = if kind == SymbolKind::Interface {
            ("extends_interfaces", RelationshipKind::Extends)
        } else {
            ("super_interfaces", RelationshipKind::Implements)
        };
        let clause = node
            .child_by_field_name("interfaces")
            .or_else(|| named_children(node).into_iter().find(|c| c.kind() == field));
        if let Some(clause) = clause {
            for list in named_children(clause) {
                if list.kind() == "type_list" {
                    for target in named_children(list) {
                        self.type_reference(&qualified, target, rel);
                    }
                }
            }
        }

        if let Some(body) = node.child_by_field_name("body") {
            let inner = Owner {
                qualified,
                interface: kind == SymbolKind::Interface,
            };
            self.members(body, Some(&inner));
        }
    }

    fn type_reference(&mut self, from: &str, target: Node, kind: RelationshipKind) {
        let raw = text(target, self.src);
        let base = raw.split('<').next().unwrap_or(raw).trim();
        self.out
            .reference(Some(from), last_segment(base), kind, lines(target).0);
    }

    fn method(&mut self, node: Node, owner: Option<&Owner>) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let parent = owner.map(|o| o.qualified.as_str());
        let qualified = qualify(parent, name, ".");
        let mods = self.modifiers(node);
        let in_interface = owner.map(|o| o.interface).unwrap_or(false);
        let (start, end) = lines(node);
        let body = node.child_by_field_name("body");
        let is_test = self.test_file || mods.annotations.iter().any(|a| a == "Test");

        let mut draft = SymbolDraft::new(SymbolKind::Method, name, qualified.clone(), start, end)
            .with_parent(parent)
            .with_modifier(Modifier::Exported, mods.has("public") || in_interface)
            .with_modifier(Modifier::Static, mods.has("static"))
            .with_modifier(
                Modifier::Abstract,
                mods.has("abstract") || (in_interface && body.is_none()),
            )
            .with_modifier(Modifier::Test, is_test);
        draft.params = node
            .child_by_field_name("parameters")
            .map(|p| self.parameters(p))
            .unwrap_or_default();
        draft.return_type = field_text(node, "type", self.src).map(one_line);
        draft.doc = block_doc_above(node, self.src);
        draft.decorators = mods.annotations;
        self.out.push(draft);

        if let Some(body) = body {
            self.calls(body, &qualified);
        }
    }

    /// Only `static final` fields are indexed, as constants.
    fn field(&mut self, node: Node, owner: Option<&Owner>) {
        let mods = self.modifiers(node);
        let in_interface = owner.map(|o| o.interface).unwrap_or(false);
        if !(in_interface || node.kind() == "constant_declaration" || (mods.has("static") && mods.has("final"))) {
            return;
        }
        let parent = owner.map(|o| o.qualified.as_str());
        let type_hint = field_text(node, "type", self.src).map(one_line);

        let mut cursor = node.walk();
        let declarators: Vec<Node> = node.children_by_field_name("declarator", &mut cursor).collect();
        for declarator in declarators {
            let Some(name) = field_text(declarator, "name", self.src) else {
                continue;
            };
            let (start, end) = lines(node);
            let mut draft = SymbolDraft::new(
                SymbolKind::Constant,
                name,
                qualify(parent, name, "."),
                start,
                end,
            )
            .with_parent(parent)
            .with_modifier(Modifier::Exported, mods.has("public") || in_interface)
            .with_modifier(Modifier::Static, true)
            .with_modifier(Modifier::Test, self.test_file);
            draft.return_type = type_hint.clone();
            draft.doc = block_doc_above(node, self.src);
            self.out.push(draft);
        }
    }

    fn import(&mut self, node: Node) {
        let Some(path) = named_children(node)
            .into_iter()
            .find(|c| matches!(c.kind(), "scoped_identifier" | "identifier"))
            .map(|c| text(c, self.src).to_string())
        else {
            return;
        };
        let wildcard = children(node).iter().any(|c| c.kind() == "asterisk");
        let path = if wildcard { format!("{}.*", path) } else { path };
        let (start, end) = lines(node);
        self.out
            .push(SymbolDraft::new(SymbolKind::Import, path.clone(), path.clone(), start, end));
        self.out
            .reference(Some(&path), path.clone(), RelationshipKind::Imports, start);
    }

    fn calls(&mut self, node: Node, from: &str) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let target = match current.kind() {
                "method_invocation" => field_text(current, "name", self.src),
                "object_creation_expression" => field_text(current, "type", self.src)
                    .map(|t| last_segment(t.split('<').next().unwrap_or(t))),
                _ => None,
            };
            if let Some(target) = target {
                self.out
                    .reference(Some(from), target, RelationshipKind::Calls, lines(current).0);
            }
            // Anonymous and local classes are not walked for calls
            if current.kind() == "class_body" {
                continue;
            }
            let mut kids = named_children(current);
            kids.reverse();
            stack.extend(kids);
        }
    }

    fn modifiers(&self, node: Node) -> Modifiers {
        let mut mods = Modifiers::default();
        let Some(list) = named_children(node).into_iter().find(|c| c.kind() == "modifiers") else {
            return mods;
        };
        for child in children(list) {
            match child.kind() {
                "marker_annotation" | "annotation" => {
                    if let Some(name) = field_text(child, "name", self.src) {
                        mods.annotations.push(name.to_string());
                    }
                }
                kind if !child.is_named() => mods.keywords.push(kind.to_string()),
                _ => {}
            }
        }
        mods
    }

    fn parameters(&self, list: Node) -> Vec<Param> {
        named_children(list)
            .into_iter()
            .filter_map(|p| match p.kind() {
                "formal_parameter" => Some(Param::new(
                    field_text(p, "name", self.src)?,
                    field_text(p, "type", self.src).map(one_line),
                )),
                "spread_parameter" => {
                    let declarator = named_children(p)
                        .into_iter()
                        .find(|c| c.kind() == "variable_declarator")?;
                    let type_hint = named_children(p)
                        .into_iter()
                        .find(|c| c.kind() != "variable_declarator" && c.kind() != "modifiers")
                        .map(|t| format!("{}...", one_line(text(t, self.src))));
                    Some(Param::new(field_text(declarator, "name", self.src)?, type_hint))
                }
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = r#"package com.example.auth;

import java.util.List;
import com.example.store.*;

/**
 * Authenticates users against the store.
 */
@Service
public class AuthService extends BaseService implements Authenticator, Closeable {
    public static final int MAX_ATTEMPTS = 5;
    private final UserStore store;

    public AuthService(UserStore store) {
        this.store = store;
    }

    @Override
    public boolean authenticate(String user, char[] password) {
        return verify(store.find(user), password);
    }

    private static boolean verify(User user, char... password) {
        return new Hasher().matches(user, password);
    }
}

interface Authenticator extends Named {
    boolean authenticate(String user, char[] password);
}
"#;

    fn find<'e>(out: &'e Extraction, qualified: &str) -> &'e SymbolDraft {
        out.symbols
            .iter()
            .find(|s| s.qualified_name == qualified)
            .unwrap_or_else(|| panic!("missing {}", qualified))
    }

    #[test]
    fn test_classes_and_members() {
        let out = JavaExtractor.extract("src/main/java/AuthService.java", SOURCE).unwrap();
        assert!(out.partial.is_none());

        let class = find(&out, "AuthService");
        assert_eq!(class.kind, SymbolKind::Class);
        assert!(class.modifiers.contains(&Modifier::Exported));
        assert_eq!(class.decorators, vec!["Service".to_string()]);
        assert_eq!(class.doc.as_deref(), Some("Authenticates users against the store."));

        let auth = find(&out, "AuthService.authenticate");
        assert_eq!(auth.kind, SymbolKind::Method);
        assert_eq!(auth.return_type.as_deref(), Some("boolean"));
        assert_eq!(
            auth.params,
            vec![
                Param::new("user", Some("String".to_string())),
                Param::new("password", Some("char[]".to_string())),
            ]
        );

        let verify = find(&out, "AuthService.verify");
        assert!(verify.modifiers.contains(&Modifier::Static));
        assert!(!verify.modifiers.contains(&Modifier::Exported));
        assert_eq!(verify.params[1], Param::new("password", Some("char...".to_string())));

        assert_eq!(find(&out, "AuthService.MAX_ATTEMPTS").kind, SymbolKind::Constant);
        assert!(!out.symbols.iter().any(|s| s.name == "store" && s.kind == SymbolKind::Constant));

        let iface = find(&out, "Authenticator.authenticate");
        assert!(iface.modifiers.contains(&Modifier::Abstract));
        assert!(iface.modifiers.contains(&Modifier::Exported));
    }

    #[test]
    fn test_references() {
        let out = JavaExtractor.extract("src/main/java/AuthService.java", SOURCE).unwrap();
        let has = |kind, from: &str, target: &str| {
            out.references
                .iter()
                .any(|r| r.kind == kind && r.from.as_deref() == Some(from) && r.target == target)
        };

        assert!(has(RelationshipKind::Imports, "java.util.List", "java.util.List"));
        assert!(has(RelationshipKind::Imports, "com.example.store.*", "com.example.store.*"));
        assert!(has(RelationshipKind::Extends, "AuthService", "BaseService"));
        assert!(has(RelationshipKind::Implements, "AuthService", "Authenticator"));
        assert!(has(RelationshipKind::Implements, "AuthService", "Closeable"));
        assert!(has(RelationshipKind::Extends, "Authenticator", "Named"));
        assert!(has(RelationshipKind::Calls, "AuthService.authenticate", "verify"));
        assert!(has(RelationshipKind::Calls, "AuthService.authenticate", "find"));
        assert!(has(RelationshipKind::Calls, "AuthService.verify", "Hasher"));
    }
}

use tree_sitter::Node;

use super::{
    field_text, is_test_path, last_segment, leading_comments, lines, named_children, one_line,
    parse_tree, partial_marker, qualify, text, Extraction, Extractor, SymbolDraft,
};
use crate::error::Result;
use crate::index::{Modifier, Param, RelationshipKind, SymbolKind};

/// Go extractor using tree-sitter
pub struct GoExtractor;

impl Extractor for GoExtractor {
    fn language(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let tree = parse_tree(tree_sitter_go::LANGUAGE.into(), content, path)?;
        let mut walker = Walker {
            src: content,
            test_file: is_test_path(path),
            out: Extraction {
                partial: partial_marker(&tree),
                ..Default::default()
            },
        };

        for node in named_children(tree.root_node()) {
            match node.kind() {
                "function_declaration" => walker.function(node, None),
                "method_declaration" => {
                    let receiver = node
                        .child_by_field_name("receiver")
                        .and_then(|r| receiver_type(r, content));
                    walker.function(node, receiver);
                }
                "type_declaration" => walker.types(node),
                "const_declaration" | "var_declaration" => walker.values(node),
                "import_declaration" => walker.imports(node),
                _ => {}
            }
        }
        Ok(walker.out)
    }
}

struct Walker<'a> {
    src: &'a str,
    test_file: bool,
    out: Extraction,
}

impl<'a> Walker<'a> {
    fn function(&mut self, node: Node, receiver: Option<String>) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let qualified = qualify(receiver.as_deref(), name, ".");
        let kind = if receiver.is_some() {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };
        let (start, end) = lines(node);
        let is_test = self.test_file
            || ["Test", "Benchmark", "Example", "Fuzz"]
                .iter()
                .any(|p| name.starts_with(p));

        let mut draft = SymbolDraft::new(kind, name, qualified.clone(), start, end)
            .with_parent(receiver.as_deref())
            .with_modifier(Modifier::Exported, is_exported(name))
            .with_modifier(Modifier::Test, is_test);
        draft.params = node
            .child_by_field_name("parameters")
            .map(|p| parameters(p, self.src))
            .unwrap_or_default();
        draft.return_type = field_text(node, "result", self.src).map(one_line);
        draft.doc = leading_comments(node, self.src, &["//"]);
        self.out.push(draft);

        if let Some(body) = node.child_by_field_name("body") {
            self.calls(body, &qualified);
        }
    }

    fn types(&mut self, node: Node) {
        for spec in named_children(node) {
            if !matches!(spec.kind(), "type_spec" | "type_alias") {
                continue;
            }
            let Some(name) = field_text(spec, "name", self.src) else {
                continue;
            };
            let type_node = spec.child_by_field_name("type");
            let kind = match type_node.map(|t| t.kind()) {
                Some("interface_type") => SymbolKind::Interface,
                _ => SymbolKind::Struct,
            };
            // Grouped `type ( ... )` specs carry their own comments
            let anchor = if named_children(node).len() > 1 { spec } else { node };
            let (start, end) = lines(anchor);

            let mut draft = SymbolDraft::new(kind, name, name, start, end)
                .with_modifier(Modifier::Exported, is_exported(name))
                .with_modifier(Modifier::Test, self.test_file);
            draft.doc = leading_comments(anchor, self.src, &["//"]);
            self.out.push(draft);

            if let Some(type_node) = type_node {
                self.type_members(type_node, name);
            }
        }
    }

    /// Interface methods become symbols; embedded types become extends edges.
    fn type_members(&mut self, type_node: Node, owner: &str) {
        match type_node.kind() {
            "interface_type" => {
                for member in named_children(type_node) {
                    match member.kind() {
                        "method_elem" | "method_spec" => {
                            let Some(method) = field_text(member, "name", self.src) else {
                                continue;
                            };
                            let (start, end) = lines(member);
                            let mut draft = SymbolDraft::new(
                                SymbolKind::Method,
                                method,
                                qualify(Some(owner), method, "."),
                                start,
                                end,
                            )
                            .with_parent(Some(owner))
                            .with_modifier(Modifier::Exported, is_exported(method))
                            .with_modifier(Modifier::Abstract, true);
                            draft.params = member
                                .child_by_field_name("parameters")
                                .map(|p| parameters(p, self.src))
                                .unwrap_or_default();
                            draft.return_type = field_text(member, "result", self.src).map(one_line);
                            self.out.push(draft);
                        }
                        "type_elem" | "constraint_elem" | "interface_type_name" => {
                            let target = base_type(text(member, self.src));
                            self.out
                                .reference(Some(owner), target, RelationshipKind::Extends, lines(member).0);
                        }
                        _ => {}
                    }
                }
            }
            "struct_type" => {
                let Some(fields) = named_children(type_node)
                    .into_iter()
                    .find(|c| c.kind() == "field_declaration_list")
                else {
                    return;
                };
                for field in named_children(fields) {
                    if field.kind() == "field_declaration" && field.child_by_field_name("name").is_none() {
                        if let Some(embedded) = field_text(field, "type", self.src) {
                            self.out.reference(
                                Some(owner),
                                base_type(embedded),
                                RelationshipKind::Extends,
                                lines(field).0,
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn values(&mut self, node: Node) {
        let is_const = node.kind() == "const_declaration";
        let mut specs = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "const_spec" | "var_spec" => specs.push(child),
                "var_spec_list" => specs.extend(
                    named_children(child)
                        .into_iter()
                        .filter(|c| c.kind() == "var_spec"),
                ),
                _ => {}
            }
        }

        for spec in specs {
            let mut cursor = spec.walk();
            let names: Vec<Node> = spec.children_by_field_name("name", &mut cursor).collect();
            for name_node in names {
                let name = text(name_node, self.src);
                if name == "_" {
                    continue;
                }
                // Package-level vars only count when exported
                if !is_const && !is_exported(name) {
                    continue;
                }
                let (start, end) = lines(spec);
                let mut draft = SymbolDraft::new(SymbolKind::Constant, name, name, start, end)
                    .with_modifier(Modifier::Exported, is_exported(name))
                    .with_modifier(Modifier::Static, !is_const)
                    .with_modifier(Modifier::Test, self.test_file);
                draft.return_type = field_text(spec, "type", self.src).map(one_line);
                draft.doc = leading_comments(spec, self.src, &["//"])
                    .or_else(|| leading_comments(node, self.src, &["//"]));
                self.out.push(draft);
            }
        }
    }

    fn imports(&mut self, node: Node) {
        let mut specs = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "import_spec" => specs.push(child),
                "import_spec_list" => specs.extend(
                    named_children(child)
                        .into_iter()
                        .filter(|c| c.kind() == "import_spec"),
                ),
                _ => {}
            }
        }

        for spec in specs {
            let Some(path) = field_text(spec, "path", self.src) else {
                continue;
            };
            let path = path.trim_matches(|c| c == '"' || c == '`').to_string();
            if path.is_empty() {
                continue;
            }
            let (start, end) = lines(spec);
            self.out
                .push(SymbolDraft::new(SymbolKind::Import, path.clone(), path.clone(), start, end));
            self.out
                .reference(Some(&path), path.clone(), RelationshipKind::Imports, start);
        }
    }

    fn calls(&mut self, node: Node, from: &str) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if current.kind() == "call_expression" {
                if let Some(function) = current.child_by_field_name("function") {
                    let target = match function.kind() {
                        "identifier" => Some(text(function, self.src)),
                        "selector_expression" => field_text(function, "field", self.src),
                        _ => None,
                    };
                    if let Some(target) = target {
                        self.out
                            .reference(Some(from), target, RelationshipKind::Calls, lines(current).0);
                    }
                }
            }
            let mut kids = named_children(current);
            kids.reverse();
            stack.extend(kids);
        }
    }
}

fn parameters(list: Node, src: &str) -> Vec<Param> {
    let mut params = Vec::new();
    for decl in named_children(list) {
        if !matches!(
            decl.kind(),
            "parameter_declaration" | "variadic_parameter_declaration"
        ) {
            continue;
        }
        let type_hint = field_text(decl, "type", src).map(|t| {
            let t = one_line(t);
            if decl.kind() == "variadic_parameter_declaration" {
                format!("...{}", t)
            } else {
                t
            }
        });
        let mut cursor = decl.walk();
        let names: Vec<Node> = decl.children_by_field_name("name", &mut cursor).collect();
        if names.is_empty() {
            // Unnamed parameters keep their type only
            params.push(Param::new("_", type_hint));
            continue;
        }
        for name in names {
            params.push(Param::new(text(name, src), type_hint.clone()));
        }
    }
    params
}

/// `(s *Server[T])` gives `Server`.
fn receiver_type(receiver: Node, src: &str) -> Option<String> {
    let decl = named_children(receiver)
        .into_iter()
        .find(|c| c.kind() == "parameter_declaration")?;
    let raw = field_text(decl, "type", src)?;
    Some(base_type(raw))
}

fn base_type(raw: &str) -> String {
    let raw = raw.trim().trim_start_matches('*');
    let raw = raw.split('[').next().unwrap_or(raw);
    last_segment(raw).to_string()
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = r#"package server

import (
	"context"
	"net/http"
)

// DefaultPort is used when none is configured.
const DefaultPort = 8080

// Handler serves one route.
type Handler interface {
	io.Closer
	Route() string
}

type Server struct {
	*Base
	addr string
}

// NewServer builds a server.
func NewServer(addr string, opts ...Option) *Server {
	return &Server{addr: validate(addr)}
}

func (s *Server) Start(ctx context.Context) error {
	return http.ListenAndServe(s.addr, nil)
}
"#;

    fn find<'e>(out: &'e Extraction, qualified: &str) -> &'e SymbolDraft {
        out.symbols
            .iter()
            .find(|s| s.qualified_name == qualified)
            .unwrap_or_else(|| panic!("missing {}", qualified))
    }

    #[test]
    fn test_declarations() {
        let out = GoExtractor.extract("server/server.go", SOURCE).unwrap();
        assert!(out.partial.is_none());

        let handler = find(&out, "Handler");
        assert_eq!(handler.kind, SymbolKind::Interface);
        assert_eq!(handler.doc.as_deref(), Some("Handler serves one route."));
        assert_eq!(find(&out, "Handler.Route").parent.as_deref(), Some("Handler"));

        let new_server = find(&out, "NewServer");
        assert_eq!(new_server.kind, SymbolKind::Function);
        assert!(new_server.modifiers.contains(&Modifier::Exported));
        assert_eq!(
            new_server.params,
            vec![
                Param::new("addr", Some("string".to_string())),
                Param::new("opts", Some("...Option".to_string())),
            ]
        );
        assert_eq!(new_server.return_type.as_deref(), Some("*Server"));

        let start = find(&out, "Server.Start");
        assert_eq!(start.kind, SymbolKind::Method);
        assert_eq!(start.parent.as_deref(), Some("Server"));

        assert_eq!(find(&out, "DefaultPort").kind, SymbolKind::Constant);
    }

    #[test]
    fn test_references() {
        let out = GoExtractor.extract("server/server.go", SOURCE).unwrap();
        let has = |kind, from: &str, target: &str| {
            out.references
                .iter()
                .any(|r| r.kind == kind && r.from.as_deref() == Some(from) && r.target == target)
        };

        assert!(has(RelationshipKind::Imports, "context", "context"));
        assert!(has(RelationshipKind::Imports, "net/http", "net/http"));
        assert!(has(RelationshipKind::Extends, "Server", "Base"));
        assert!(has(RelationshipKind::Extends, "Handler", "Closer"));
        assert!(has(RelationshipKind::Calls, "NewServer", "validate"));
        assert!(has(RelationshipKind::Calls, "Server.Start", "ListenAndServe"));
    }

    #[test]
    fn test_unnamed_parameters_keep_types() {
        let out = GoExtractor
            .extract("codec/codec.go", "package codec\n\nfunc Encode([]byte, int) error {\n\treturn nil\n}\n")
            .unwrap();
        assert_eq!(
            find(&out, "Encode").params,
            vec![
                Param::new("_", Some("[]byte".to_string())),
                Param::new("_", Some("int".to_string())),
            ]
        );
    }

    #[test]
    fn test_test_functions() {
        let out = GoExtractor
            .extract("server/server_test.go", "package server\n\nfunc TestStart(t *testing.T) {}\n")
            .unwrap();
        assert!(out.symbols[0].modifiers.contains(&Modifier::Test));
    }
}

use tree_sitter::Node;

use super::{
    field_text, has_child_kind, is_test_name, is_test_path, last_segment, lines, named_children,
    one_line, parse_tree, partial_marker, qualify, text, Extraction, Extractor, SymbolDraft,
};
use crate::error::Result;
use crate::index::{Modifier, Param, RelationshipKind, SymbolKind};

/// Python extractor using tree-sitter
pub struct PythonExtractor;

impl Extractor for PythonExtractor {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let tree = parse_tree(tree_sitter_python::LANGUAGE.into(), content, path)?;
        let mut walker = Walker {
            src: content,
            test_file: is_test_path(path),
            out: Extraction {
                partial: partial_marker(&tree),
                ..Default::default()
            },
        };
        walker.visit_children(tree.root_node(), &[]);
        Ok(walker.out)
    }
}

#[derive(Debug, Clone)]
struct Frame {
    qualified: String,
    kind: SymbolKind,
}

struct Walker<'a> {
    src: &'a str,
    test_file: bool,
    out: Extraction,
}

impl<'a> Walker<'a> {
    fn visit(&mut self, node: Node, scope: &[Frame]) {
        match node.kind() {
            "decorated_definition" => {
                let decorators = named_children(node)
                    .into_iter()
                    .filter(|c| c.kind() == "decorator")
                    .map(|d| decorator_name(text(d, self.src)))
                    .collect();
                if let Some(def) = node.child_by_field_name("definition") {
                    self.definition(def, scope, decorators, Some(node));
                }
            }
            "function_definition" | "class_definition" => {
                self.definition(node, scope, Vec::new(), None)
            }
            "expression_statement" if scope.is_empty() => {
                for child in named_children(node) {
                    if child.kind() == "assignment" {
                        self.module_assignment(child);
                    }
                }
                self.visit_children(node, scope);
            }
            "import_statement" => self.import(node, scope),
            "import_from_statement" => self.import_from(node, scope),
            "call" => {
                self.call(node, scope);
                self.visit_children(node, scope);
            }
            _ => self.visit_children(node, scope),
        }
    }

    fn visit_children(&mut self, node: Node, scope: &[Frame]) {
        for child in named_children(node) {
            self.visit(child, scope);
        }
    }

    /// Functions, methods and classes. `outer` is the decorated wrapper whose
    /// span starts at the first decorator.
    fn definition(&mut self, node: Node, scope: &[Frame], decorators: Vec<String>, outer: Option<Node>) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let name = name.to_string();
        let parent = scope.last();
        let qualified = qualify(parent.map(|f| f.qualified.as_str()), &name, ".");
        let (start, end) = lines(node);
        let start = outer.map(|o| lines(o).0).unwrap_or(start);
        let body = node.child_by_field_name("body");

        let kind = if node.kind() == "class_definition" {
            SymbolKind::Class
        } else if parent.map(|f| f.kind == SymbolKind::Class).unwrap_or(false) {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };

        let mut draft = SymbolDraft::new(kind, name.clone(), qualified.clone(), start, end)
            .with_parent(parent.map(|f| f.qualified.as_str()))
            .with_modifier(Modifier::Exported, scope.is_empty() && !name.starts_with('_'))
            .with_modifier(Modifier::Test, self.test_file || is_test_name(&name))
            .with_modifier(
                Modifier::Static,
                decorators.iter().any(|d| d == "staticmethod" || d == "classmethod"),
            )
            .with_modifier(
                Modifier::Abstract,
                decorators.iter().any(|d| d.ends_with("abstractmethod")),
            );
        draft.doc = body.and_then(|b| docstring(b, self.src));

        if kind == SymbolKind::Class {
            if let Some(bases) = node.child_by_field_name("superclasses") {
                for base in named_children(bases) {
                    if matches!(base.kind(), "identifier" | "attribute") {
                        let target = last_segment(text(base, self.src)).to_string();
                        self.out
                            .reference(Some(&qualified), target, RelationshipKind::Extends, lines(base).0);
                    }
                }
            }
        } else {
            draft.params = node
                .child_by_field_name("parameters")
                .map(|p| parameters(p, self.src, kind == SymbolKind::Method))
                .unwrap_or_default();
            draft.return_type = field_text(node, "return_type", self.src).map(one_line);
            draft.modifiers.extend(
                [
                    (Modifier::Async, has_child_kind(node, "async")),
                    (Modifier::Generator, body.map(contains_yield).unwrap_or(false)),
                ]
                .into_iter()
                .filter_map(|(m, on)| on.then_some(m)),
            );
        }
        draft.decorators = decorators;
        self.out.push(draft);

        if let Some(body) = body {
            let mut inner = scope.to_vec();
            inner.push(Frame { qualified, kind });
            self.visit_children(body, &inner);
        }
    }

    fn module_assignment(&mut self, node: Node) {
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if left.kind() != "identifier" {
            return;
        }
        let name = text(left, self.src);
        let (start, end) = lines(node);

        if name == "__all__" {
            let Some(right) = node.child_by_field_name("right") else {
                return;
            };
            for item in named_children(right) {
                if item.kind() != "string" {
                    continue;
                }
                let exported = strip_string(text(item, self.src));
                if exported.is_empty() {
                    continue;
                }
                let line = lines(item).0;
                self.out.push(
                    SymbolDraft::new(SymbolKind::Export, exported.clone(), exported, line, line)
                        .with_modifier(Modifier::Exported, true),
                );
            }
            return;
        }

        if is_constant_name(name) {
            let mut draft = SymbolDraft::new(SymbolKind::Constant, name, name, start, end)
                .with_modifier(Modifier::Exported, !name.starts_with('_'))
                .with_modifier(Modifier::Test, self.test_file);
            draft.return_type = field_text(node, "type", self.src).map(one_line);
            self.out.push(draft);
        }
    }

    fn import(&mut self, node: Node, scope: &[Frame]) {
        let parent = scope.last().map(|f| f.qualified.as_str());
        let mut cursor = node.walk();
        let modules: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        for module in modules {
            let module_node = if module.kind() == "aliased_import" {
                module.child_by_field_name("name").unwrap_or(module)
            } else {
                module
            };
            let module_name = text(module_node, self.src).to_string();
            self.push_import(node, module_name, parent);
        }
    }

    fn import_from(&mut self, node: Node, scope: &[Frame]) {
        let parent = scope.last().map(|f| f.qualified.as_str());
        let Some(module) = field_text(node, "module_name", self.src) else {
            return;
        };
        let module = module.to_string();

        // `from . import views` depends on `.views`, not on the package itself
        if module.chars().all(|c| c == '.') {
            let mut cursor = node.walk();
            let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
            for imported in names {
                let imported = if imported.kind() == "aliased_import" {
                    imported.child_by_field_name("name").unwrap_or(imported)
                } else {
                    imported
                };
                let target = format!("{}{}", module, text(imported, self.src));
                self.push_import(node, target, parent);
            }
        } else {
            self.push_import(node, module, parent);
        }
    }

    fn push_import(&mut self, node: Node, module: String, parent: Option<&str>) {
        if module.is_empty() {
            return;
        }
        let (start, end) = lines(node);
        self.out.push(
            SymbolDraft::new(SymbolKind::Import, module.clone(), module.clone(), start, end)
                .with_parent(parent),
        );
        self.out
            .reference(Some(&module), module.clone(), RelationshipKind::Imports, start);
    }

    fn call(&mut self, node: Node, scope: &[Frame]) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let target = match function.kind() {
            "identifier" => text(function, self.src),
            "attribute" => field_text(function, "attribute", self.src).unwrap_or(""),
            _ => return,
        };
        let from = scope.last().map(|f| f.qualified.as_str());
        self.out
            .reference(from, target, RelationshipKind::Calls, lines(node).0);
    }
}

fn parameters(node: Node, src: &str, is_method: bool) -> Vec<Param> {
    let mut params = Vec::new();
    for child in named_children(node) {
        let param = match child.kind() {
            "identifier" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                Param::new(text(child, src), None)
            }
            "typed_parameter" => {
                let name = named_children(child)
                    .first()
                    .map(|n| text(*n, src))
                    .unwrap_or("");
                Param::new(name, field_text(child, "type", src).map(one_line))
            }
            "default_parameter" | "typed_default_parameter" => Param::new(
                field_text(child, "name", src).unwrap_or(""),
                field_text(child, "type", src).map(one_line),
            ),
            _ => continue,
        };
        if !param.name.is_empty() {
            params.push(param);
        }
    }

    if is_method && params.first().map(|p| p.name == "self" || p.name == "cls").unwrap_or(false) {
        params.remove(0);
    }
    params
}

fn decorator_name(raw: &str) -> String {
    let raw = raw.trim().trim_start_matches('@');
    raw.split('(').next().unwrap_or(raw).trim().to_string()
}

fn docstring(body: Node, src: &str) -> Option<String> {
    let first = named_children(body).into_iter().next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = named_children(first).into_iter().next()?;
    if string.kind() != "string" {
        return None;
    }
    let doc = strip_string(text(string, src));
    let doc = doc
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    (!doc.is_empty()).then_some(doc)
}

fn strip_string(raw: &str) -> String {
    let s = raw.trim_start_matches(|c: char| "rRuUbBfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if s.len() >= quote.len() * 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[quote.len()..s.len() - quote.len()].trim().to_string();
        }
    }
    s.trim().to_string()
}

/// True if `body` yields, ignoring nested scopes.
fn contains_yield(body: Node) -> bool {
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        for child in named_children(node) {
            match child.kind() {
                "yield" => return true,
                "function_definition" | "lambda" | "class_definition" => {}
                _ => stack.push(child),
            }
        }
    }
    false
}

fn is_constant_name(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = r#"
import os
from typing import List, Optional

MAX_RETRIES = 3
__all__ = ["UserProfile", "load"]


class UserProfile(BaseModel):
    """A user's public profile.

    Longer description.
    """

    def __init__(self, name: str):
        self.name = name

    @staticmethod
    def create(name, *args, **kwargs) -> "UserProfile":
        return UserProfile(name)

    async def refresh(self):
        await fetch(self.name)


def load(path: str, limit: int = 10) -> List[str]:
    def inner():
        yield from os.listdir(path)
    return list(inner())
"#;

    fn extract() -> Extraction {
        PythonExtractor.extract("app/models.py", SOURCE).unwrap()
    }

    /// Declarations only; `__all__` and export lists reuse the same names.
    fn find<'e>(out: &'e Extraction, qualified: &str) -> &'e SymbolDraft {
        out.symbols
            .iter()
            .find(|s| s.kind != SymbolKind::Export && s.qualified_name == qualified)
            .unwrap_or_else(|| panic!("missing {}", qualified))
    }

    #[test]
    fn test_classes_and_methods() {
        let out = extract();
        assert!(out.partial.is_none());

        let class = find(&out, "UserProfile");
        assert_eq!(class.kind, SymbolKind::Class);
        assert_eq!(class.start_line, 9);
        assert_eq!(class.doc.as_deref().map(|d| d.lines().next().unwrap()), Some("A user's public profile."));
        assert!(class.modifiers.contains(&Modifier::Exported));

        let create = find(&out, "UserProfile.create");
        assert_eq!(create.kind, SymbolKind::Method);
        assert_eq!(create.parent.as_deref(), Some("UserProfile"));
        assert_eq!(create.decorators, vec!["staticmethod".to_string()]);
        assert!(create.modifiers.contains(&Modifier::Static));
        assert_eq!(create.params.len(), 3);
        assert_eq!(create.return_type.as_deref(), Some("\"UserProfile\""));

        let refresh = find(&out, "UserProfile.refresh");
        assert!(refresh.modifiers.contains(&Modifier::Async));
        assert!(refresh.params.is_empty());
    }

    #[test]
    fn test_functions_constants_and_exports() {
        let out = extract();

        let load = find(&out, "load");
        assert_eq!(load.kind, SymbolKind::Function);
        assert_eq!(load.params[0], Param::new("path", Some("str".to_string())));
        assert_eq!(load.params[1].name, "limit");
        assert_eq!(load.return_type.as_deref(), Some("List[str]"));

        let inner = find(&out, "load.inner");
        assert_eq!(inner.parent.as_deref(), Some("load"));
        assert!(inner.modifiers.contains(&Modifier::Generator));
        assert!(!inner.modifiers.contains(&Modifier::Exported));

        assert_eq!(find(&out, "MAX_RETRIES").kind, SymbolKind::Constant);
        let exports: Vec<_> = out
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Export)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(exports, vec!["UserProfile", "load"]);
    }

    #[test]
    fn test_references() {
        let out = extract();

        let imports: Vec<_> = out
            .references
            .iter()
            .filter(|r| r.kind == RelationshipKind::Imports)
            .map(|r| r.target.as_str())
            .collect();
        assert_eq!(imports, vec!["os", "typing"]);

        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Extends
            && r.from.as_deref() == Some("UserProfile")
            && r.target == "BaseModel"));
        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Calls
            && r.from.as_deref() == Some("UserProfile.refresh")
            && r.target == "fetch"));
        assert!(out.references.iter().any(|r| r.kind == RelationshipKind::Calls
            && r.from.as_deref() == Some("load.inner")
            && r.target == "listdir"));
    }

    #[test]
    fn test_syntax_errors_yield_partial_result() {
        let source = "def ok():\n    pass\n\ndef broken(:\n    pass\n";
        let out = PythonExtractor.extract("broken.py", source).unwrap();
        assert!(out.partial.is_some());
        assert!(out.symbols.iter().any(|s| s.name == "ok"));
    }

    #[test]
    fn test_files_under_tests_are_marked() {
        let out = PythonExtractor
            .extract("tests/test_auth.py", "def test_login():\n    pass\n")
            .unwrap();
        assert!(out.symbols[0].modifiers.contains(&Modifier::Test));
    }
}

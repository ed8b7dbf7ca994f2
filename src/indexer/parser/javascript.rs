use tree_sitter::{Language, Node};

use super::{
    block_doc_above, collect_descendants, field_text, has_child_kind, is_test_name, is_test_path,
    last_segment, lines, named_children, one_line, parse_tree, partial_marker, qualify, text,
    Extraction, Extractor, SymbolDraft,
};
use crate::error::Result;
use crate::index::{Modifier, Param, RelationshipKind, SymbolKind};

/// Grammar variant handled by a [`JavaScriptExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsDialect {
    JavaScript,
    TypeScript,
    Tsx,
}

/// JavaScript / TypeScript extractor with React component detection
pub struct JavaScriptExtractor {
    dialect: JsDialect,
}

const COMPONENT_BASES: &[&str] = &["Component", "PureComponent"];
const FUNCTION_VALUES: &[&str] = &[
    "arrow_function",
    "function_expression",
    "function",
    "generator_function",
];
const JSX_KINDS: &[&str] = &["jsx_element", "jsx_self_closing_element", "jsx_fragment"];

impl JavaScriptExtractor {
    pub fn new(dialect: JsDialect) -> Self {
        Self { dialect }
    }

    fn grammar(&self) -> Language {
        match self.dialect {
            JsDialect::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            JsDialect::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            JsDialect::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        }
    }
}

impl Extractor for JavaScriptExtractor {
    fn language(&self) -> &'static str {
        match self.dialect {
            JsDialect::JavaScript => "javascript",
            JsDialect::TypeScript => "typescript",
            JsDialect::Tsx => "tsx",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self.dialect {
            JsDialect::JavaScript => &["js", "jsx", "mjs", "cjs"],
            JsDialect::TypeScript => &["ts", "mts", "cts"],
            JsDialect::Tsx => &["tsx"],
        }
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let tree = parse_tree(self.grammar(), content, path)?;
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
            "export_statement" => self.export_statement(node, scope),
            "import_statement" => self.import(node, scope),
            "method_definition" => self.method(node, scope),
            "call_expression" => {
                self.call(node, scope);
                self.visit_children(node, scope);
            }
            _ if is_declaration(node.kind()) => self.declaration(node, scope, false, node),
            _ => self.visit_children(node, scope),
        }
    }

    fn visit_children(&mut self, node: Node, scope: &[Frame]) {
        for child in named_children(node) {
            self.visit(child, scope);
        }
    }

    /// `anchor` is the outermost statement; its span and doc comment win.
    fn declaration(&mut self, node: Node, scope: &[Frame], exported: bool, anchor: Node) {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                if let Some(name) = field_text(node, "name", self.src) {
                    self.function(node, name, scope, exported, anchor);
                }
            }
            "class_declaration" | "abstract_class_declaration" | "class" => {
                self.class(node, scope, exported, anchor)
            }
            "interface_declaration" => self.interface(node, scope, exported, anchor),
            "enum_declaration" => {
                if let Some(name) = field_text(node, "name", self.src) {
                    let (start, end) = span(anchor, node);
                    let parent = scope.last().map(|f| f.qualified.as_str());
                    let mut draft = SymbolDraft::new(
                        SymbolKind::Struct,
                        name,
                        qualify(parent, name, "."),
                        start,
                        end,
                    )
                    .with_parent(parent)
                    .with_modifier(Modifier::Exported, exported);
                    draft.doc = block_doc_above(anchor, self.src);
                    self.out.push(draft);
                }
            }
            "lexical_declaration" | "variable_declaration" => {
                self.variables(node, scope, exported, anchor)
            }
            _ => self.visit_children(node, scope),
        }
    }

    fn export_statement(&mut self, node: Node, scope: &[Frame]) {
        if let Some(decl) = node.child_by_field_name("declaration") {
            self.declaration(decl, scope, true, node);
            return;
        }

        let line = lines(node).0;
        let source = field_text(node, "source", self.src).map(unquote);

        for child in named_children(node) {
            if child.kind() != "export_clause" {
                continue;
            }
            for spec in named_children(child) {
                if spec.kind() != "export_specifier" {
                    continue;
                }
                let exported = field_text(spec, "alias", self.src)
                    .or_else(|| field_text(spec, "name", self.src));
                if let Some(name) = exported {
                    self.push_export(name, line);
                }
            }
        }

        // `export default App;`
        if let Some(value) = node.child_by_field_name("value") {
            if value.kind() == "identifier" {
                self.push_export(text(value, self.src), line);
            } else {
                self.visit(value, scope);
            }
        }

        // Re-exports depend on their source module
        if let Some(source) = source {
            self.push_import(node, source, scope);
        }
    }

    fn push_export(&mut self, name: &str, line: u32) {
        self.out.push(
            SymbolDraft::new(SymbolKind::Export, name, name, line, line)
                .with_modifier(Modifier::Exported, true),
        );
    }

    fn variables(&mut self, node: Node, scope: &[Frame], exported: bool, anchor: Node) {
        for declarator in named_children(node) {
            if declarator.kind() != "variable_declarator" {
                continue;
            }
            let Some(name_node) = declarator.child_by_field_name("name") else {
                continue;
            };
            if name_node.kind() != "identifier" {
                self.visit_children(declarator, scope);
                continue;
            }
            let name = text(name_node, self.src);
            let value = declarator.child_by_field_name("value");

            match value {
                Some(v) if FUNCTION_VALUES.contains(&v.kind()) => {
                    self.function(v, name, scope, exported, anchor)
                }
                Some(v) if v.kind() == "class" => self.class_named(v, name, scope, exported, anchor),
                _ => {
                    if scope.is_empty() && (exported || is_constant_name(name)) {
                        let (start, end) = lines(anchor);
                        let mut draft =
                            SymbolDraft::new(SymbolKind::Constant, name, name, start, end)
                                .with_modifier(Modifier::Exported, exported)
                                .with_modifier(Modifier::Test, self.test_file);
                        draft.return_type = field_text(declarator, "type", self.src)
                            .map(|t| one_line(t.trim_start_matches(':').trim()));
                        draft.doc = block_doc_above(anchor, self.src);
                        self.out.push(draft);
                    }
                    if let Some(v) = value {
                        self.visit(v, scope);
                    }
                }
            }
        }
    }

    fn function(&mut self, node: Node, name: &str, scope: &[Frame], exported: bool, anchor: Node) {
        let parent = scope.last();
        let qualified = qualify(parent.map(|f| f.qualified.as_str()), name, ".");
        let (start, end) = span(anchor, node);
        let body = node.child_by_field_name("body");

        // Arrow bodies may be the JSX expression itself
        let renders_jsx = body
            .map(|b| {
                JSX_KINDS.contains(&b.kind())
                    || !collect_descendants(b, &[], |n| JSX_KINDS.contains(&n.kind())).is_empty()
            })
            .unwrap_or(false);
        let kind = if renders_jsx && is_pascal_case(name) {
            SymbolKind::Component
        } else if parent.map(|f| f.kind.is_class_like()).unwrap_or(false) {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };

        let mut draft = SymbolDraft::new(kind, name, qualified.clone(), start, end)
            .with_parent(parent.map(|f| f.qualified.as_str()))
            .with_modifier(Modifier::Exported, exported)
            .with_modifier(Modifier::Async, has_child_kind(node, "async"))
            .with_modifier(
                Modifier::Generator,
                node.kind().contains("generator") || has_child_kind(node, "*"),
            )
            .with_modifier(Modifier::Test, self.test_file || is_test_name(name));
        draft.params = self.parameters(node);
        draft.return_type = return_type(node, self.src);
        draft.doc = block_doc_above(anchor, self.src);
        if kind == SymbolKind::Component {
            draft.decorators = body.map(|b| self.hooks(b)).unwrap_or_default();
        }
        self.out.push(draft);

        if let Some(body) = body {
            let mut inner = scope.to_vec();
            inner.push(Frame { qualified, kind });
            self.visit(body, &inner);
        }
    }

    fn method(&mut self, node: Node, scope: &[Frame]) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let parent = scope.last();
        let qualified = qualify(parent.map(|f| f.qualified.as_str()), name, ".");
        let (start, end) = lines(node);

        let mut draft = SymbolDraft::new(SymbolKind::Method, name, qualified.clone(), start, end)
            .with_parent(parent.map(|f| f.qualified.as_str()))
            .with_modifier(Modifier::Static, has_child_kind(node, "static"))
            .with_modifier(Modifier::Async, has_child_kind(node, "async"))
            .with_modifier(Modifier::Generator, has_child_kind(node, "*"))
            .with_modifier(Modifier::Abstract, has_child_kind(node, "abstract"))
            .with_modifier(Modifier::Test, self.test_file);
        draft.params = self.parameters(node);
        draft.return_type = return_type(node, self.src);
        draft.doc = block_doc_above(node, self.src);
        self.out.push(draft);

        if let Some(body) = node.child_by_field_name("body") {
            let mut inner = scope.to_vec();
            inner.push(Frame {
                qualified,
                kind: SymbolKind::Method,
            });
            self.visit(body, &inner);
        }
    }

    fn class(&mut self, node: Node, scope: &[Frame], exported: bool, anchor: Node) {
        if let Some(name) = field_text(node, "name", self.src) {
            self.class_named(node, name, scope, exported, anchor);
        }
    }

    fn class_named(&mut self, node: Node, name: &str, scope: &[Frame], exported: bool, anchor: Node) {
        let parent = scope.last().map(|f| f.qualified.as_str());
        let qualified = qualify(parent, name, ".");
        let (start, end) = span(anchor, node);

        let mut is_component = false;
        for heritage in named_children(node) {
            if heritage.kind() != "class_heritage" {
                continue;
            }
            for clause in named_children(heritage) {
                let (kind, targets) = match clause.kind() {
                    "extends_clause" => (RelationshipKind::Extends, named_children(clause)),
                    "implements_clause" => (RelationshipKind::Implements, named_children(clause)),
                    _ => (RelationshipKind::Extends, vec![clause]),
                };
                for target in targets {
                    if target.kind() == "type_arguments" {
                        continue;
                    }
                    let base = base_name(text(target, self.src));
                    if kind == RelationshipKind::Extends && COMPONENT_BASES.contains(&base.as_str()) {
                        is_component = true;
                    }
                    self.out
                        .reference(Some(&qualified), base, kind, lines(target).0);
                }
            }
        }

        let kind = if is_component {
            SymbolKind::Component
        } else {
            SymbolKind::Class
        };
        let mut draft = SymbolDraft::new(kind, name, qualified.clone(), start, end)
            .with_parent(parent)
            .with_modifier(Modifier::Exported, exported)
            .with_modifier(Modifier::Abstract, node.kind() == "abstract_class_declaration")
            .with_modifier(Modifier::Test, self.test_file);
        draft.doc = block_doc_above(anchor, self.src);
        if is_component {
            if let Some(body) = node.child_by_field_name("body") {
                draft.decorators = self.hooks(body);
            }
        }
        self.out.push(draft);

        if let Some(body) = node.child_by_field_name("body") {
            let mut inner = scope.to_vec();
            inner.push(Frame { qualified, kind });
            self.visit_children(body, &inner);
        }
    }

    fn interface(&mut self, node: Node, scope: &[Frame], exported: bool, anchor: Node) {
        let Some(name) = field_text(node, "name", self.src) else {
            return;
        };
        let parent = scope.last().map(|f| f.qualified.as_str());
        let qualified = qualify(parent, name, ".");
        let (start, end) = span(anchor, node);

        for clause in named_children(node) {
            if clause.kind() != "extends_type_clause" {
                continue;
            }
            for target in named_children(clause) {
                let base = base_name(text(target, self.src));
                self.out
                    .reference(Some(&qualified), base, RelationshipKind::Extends, lines(target).0);
            }
        }

        let mut draft = SymbolDraft::new(SymbolKind::Interface, name, qualified.clone(), start, end)
            .with_parent(parent)
            .with_modifier(Modifier::Exported, exported);
        draft.doc = block_doc_above(anchor, self.src);
        self.out.push(draft);

        let Some(body) = node.child_by_field_name("body") else {
            return;
        };
        for member in named_children(body) {
            if member.kind() != "method_signature" {
                continue;
            }
            let Some(method) = field_text(member, "name", self.src) else {
                continue;
            };
            let (start, end) = lines(member);
            let mut sig = SymbolDraft::new(
                SymbolKind::Method,
                method,
                qualify(Some(&qualified), method, "."),
                start,
                end,
            )
            .with_parent(Some(&qualified))
            .with_modifier(Modifier::Abstract, true);
            sig.params = self.parameters(member);
            sig.return_type = return_type(member, self.src);
            self.out.push(sig);
        }
    }

    fn import(&mut self, node: Node, scope: &[Frame]) {
        if let Some(source) = field_text(node, "source", self.src).map(unquote) {
            self.push_import(node, source, scope);
        }
    }

    fn push_import(&mut self, node: Node, source: String, scope: &[Frame]) {
        if source.is_empty() {
            return;
        }
        let (start, end) = lines(node);
        let parent = scope.last().map(|f| f.qualified.as_str());
        self.out.push(
            SymbolDraft::new(SymbolKind::Import, source.clone(), source.clone(), start, end)
                .with_parent(parent),
        );
        self.out
            .reference(Some(&source), source.clone(), RelationshipKind::Imports, start);
    }

    fn call(&mut self, node: Node, scope: &[Frame]) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let target = match function.kind() {
            "identifier" => text(function, self.src),
            "member_expression" => field_text(function, "property", self.src).unwrap_or(""),
            _ => return,
        };

        // CommonJS `require("x")` is an import
        if target == "require" {
            let source = node
                .child_by_field_name("arguments")
                .and_then(|args| named_children(args).into_iter().next())
                .filter(|arg| arg.kind() == "string")
                .map(|arg| unquote(text(arg, self.src)));
            if let Some(source) = source {
                self.push_import(node, source, scope);
            }
            return;
        }

        let from = scope.last().map(|f| f.qualified.as_str());
        self.out
            .reference(from, target, RelationshipKind::Calls, lines(node).0);
    }

    fn parameters(&self, node: Node) -> Vec<Param> {
        // Arrow functions with a single bare parameter
        if let Some(single) = node.child_by_field_name("parameter") {
            return vec![Param::new(text(single, self.src), None)];
        }
        let Some(list) = node.child_by_field_name("parameters") else {
            return Vec::new();
        };

        named_children(list)
            .into_iter()
            .filter_map(|p| {
                let (name, type_hint) = match p.kind() {
                    "identifier" | "rest_pattern" | "object_pattern" | "array_pattern" => {
                        (text(p, self.src).to_string(), None)
                    }
                    "assignment_pattern" => (field_text(p, "left", self.src)?.to_string(), None),
                    "required_parameter" | "optional_parameter" => {
                        let name = field_text(p, "pattern", self.src)?.to_string();
                        let type_hint = field_text(p, "type", self.src)
                            .map(|t| one_line(t.trim_start_matches(':').trim()));
                        (name, type_hint)
                    }
                    _ => return None,
                };
                Some(Param::new(one_line(&name), type_hint))
            })
            .collect()
    }

    /// `useXxx(...)` calls inside a component, as `hook:useXxx` tags.
    fn hooks(&self, body: Node) -> Vec<String> {
        let mut hooks: Vec<String> = Vec::new();
        for call in collect_descendants(body, &[], |n| n.kind() == "call_expression") {
            let Some(function) = call.child_by_field_name("function") else {
                continue;
            };
            if function.kind() != "identifier" {
                continue;
            }
            let name = text(function, self.src);
            if is_hook_name(name) {
                let tag = format!("hook:{}", name);
                if !hooks.contains(&tag) {
                    hooks.push(tag);
                }
            }
        }
        hooks
    }
}

fn is_declaration(kind: &str) -> bool {
    matches!(
        kind,
        "function_declaration"
            | "generator_function_declaration"
            | "class_declaration"
            | "abstract_class_declaration"
            | "interface_declaration"
            | "enum_declaration"
            | "lexical_declaration"
            | "variable_declaration"
    )
}

/// Line span from the outer statement start to the declaration end.
fn span(anchor: Node, node: Node) -> (u32, u32) {
    let (start, _) = lines(anchor);
    let (_, end) = lines(node);
    (start, end.max(lines(anchor).1))
}

fn return_type(node: Node, src: &str) -> Option<String> {
    field_text(node, "return_type", src).map(|t| one_line(t.trim_start_matches(':').trim()))
}

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').to_string()
}

/// `React.Component<Props>` gives `Component`.
fn base_name(raw: &str) -> String {
    let without_generics = raw.split('<').next().unwrap_or(raw).trim();
    last_segment(without_generics).to_string()
}

fn is_pascal_case(name: &str) -> bool {
    name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
}

fn is_hook_name(name: &str) -> bool {
    name.strip_prefix("use")
        .and_then(|rest| rest.chars().next())
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
}

fn is_constant_name(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

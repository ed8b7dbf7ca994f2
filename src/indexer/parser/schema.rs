use once_cell::sync::Lazy;
use regex::Regex;

use super::template::LineIndex;
use super::{extension_of, Extraction, Extractor, SymbolDraft};
use crate::error::Result;
use crate::index::{Modifier, RelationshipKind, SymbolKind};

/// Pattern extractor for SQL DDL, Prisma and GraphQL schema files.
pub struct SchemaExtractor;

static SQL_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?im)^[ \t]*create\s+(?:or\s+replace\s+)?(?:temp(?:orary)?\s+)?(table|view|function|procedure)\s+(?:if\s+not\s+exists\s+)?[`"\[]?(?:\w+[`"\]]?\.[`"\[]?)?(\w+)"#,
    )
    .expect("valid regex")
});
static SQL_REFERENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\breferences\s+[`"\[]?(?:\w+[`"\]]?\.[`"\[]?)?(\w+)"#).expect("valid regex")
});
static PRISMA_DECL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*(model|enum|type|view)\s+(\w+)\s*\{").expect("valid regex"));
static GRAPHQL_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(type|interface|input|enum|union|scalar)\s+(\w+)(?:\s+implements\s+([\w\s&,]+?))?\s*(?:\{|=|$)",
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Sql,
    Prisma,
    GraphQl,
}

impl Extractor for SchemaExtractor {
    fn language(&self) -> &'static str {
        "schema"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["sql", "prisma", "graphql", "gql"]
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let dialect = match extension_of(path).as_deref() {
            Some("prisma") => Dialect::Prisma,
            Some("graphql") | Some("gql") => Dialect::GraphQl,
            _ => Dialect::Sql,
        };
        let index = LineIndex::new(content);
        let mut out = Extraction::default();

        match dialect {
            Dialect::Sql => sql(content, &index, &mut out),
            Dialect::Prisma => declarations(&PRISMA_DECL, content, &index, &mut out),
            Dialect::GraphQl => declarations(&GRAPHQL_DECL, content, &index, &mut out),
        }
        Ok(out)
    }
}

fn sql(content: &str, index: &LineIndex, out: &mut Extraction) {
    for caps in SQL_TABLE.captures_iter(content) {
        let Some(whole) = caps.get(0) else { continue };
        let kind = match caps[1].to_ascii_lowercase().as_str() {
            "function" | "procedure" => SymbolKind::Function,
            _ => SymbolKind::Struct,
        };
        let name = &caps[2];
        let start = index.line_of(whole.start());
        let body_end = statement_end(content, whole.end());
        let end = index.line_of(body_end);

        let mut draft = SymbolDraft::new(kind, name, name, start, end)
            .with_modifier(Modifier::Exported, true);
        draft.return_type = Some(caps[1].to_ascii_lowercase());
        out.push(draft);

        // Foreign keys make one table depend on another
        let body = content.get(whole.end()..body_end).unwrap_or("");
        for fk in SQL_REFERENCES.captures_iter(body) {
            let Some(m) = fk.get(0) else { continue };
            out.reference(
                Some(name),
                &fk[1],
                RelationshipKind::Calls,
                index.line_of(whole.end() + m.start()),
            );
        }
    }
}

fn declarations(pattern: &Regex, content: &str, index: &LineIndex, out: &mut Extraction) {
    for caps in pattern.captures_iter(content) {
        let Some(whole) = caps.get(0) else { continue };
        let keyword = &caps[1];
        let name = &caps[2];
        let kind = match keyword {
            "interface" => SymbolKind::Interface,
            _ => SymbolKind::Struct,
        };
        let start = index.line_of(whole.start());
        let end = if whole.as_str().trim_end().ends_with('{') {
            index.line_of(block_end(content, whole.end()))
        } else {
            start
        };

        let mut draft = SymbolDraft::new(kind, name, name, start, end)
            .with_modifier(Modifier::Exported, true);
        draft.return_type = Some(keyword.to_string());
        out.push(draft);

        if let Some(interfaces) = caps.get(3) {
            for target in interfaces
                .as_str()
                .split(['&', ','])
                .map(str::trim)
                .filter(|t| !t.is_empty())
            {
                out.reference(Some(name), target, RelationshipKind::Implements, start);
            }
        }
    }
}

/// Offset of the `}` closing a block opened just before `from`.
fn block_end(content: &str, from: usize) -> usize {
    let mut depth = 1usize;
    for (i, c) in content.get(from..).unwrap_or("").char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return from + i;
                }
            }
            _ => {}
        }
    }
    content.len()
}

/// Offset of the `;` ending a statement, skipping parenthesised and quoted text.
fn statement_end(content: &str, from: usize) -> usize {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in content.get(from..).unwrap_or("").char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ';') if depth <= 0 => return from + i,
            _ => {}
        }
    }
    content.len()
}

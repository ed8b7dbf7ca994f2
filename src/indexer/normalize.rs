// Canonicalises extractor drafts into stored symbols, edges and tiers

use std::collections::{HashMap, HashSet};

use super::parser::{last_segment, Extraction, SymbolDraft};
use crate::index::{
    estimate_tokens, Modifier, Param, Relationship, RelationshipKind, Signature, Symbol,
    SymbolKind, Tiers,
};

/// Characters kept from the first doc line.
pub const DOC_SUMMARY_CHARS: usize = 100;
const MAX_NAME_CHARS: usize = 80;
const SUMMARY_SIGNATURE_CHARS: usize = 150;
const SUMMARY_PARAMS: usize = 5;
const SUMMARY_DECORATORS: usize = 3;

/// Normalized content of one file, ready for `upsert_file`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFile {
    /// Ordered by start line.
    pub symbols: Vec<Symbol>,
    pub relationships: Vec<Relationship>,
    /// References whose source could not be attributed to a symbol.
    pub dropped_references: usize,
}

/// Stable id from path, kind and qualified name. `ordinal` separates
/// same-named declarations in one file (overloads, redefinitions).
pub fn symbol_id(path: &str, kind: SymbolKind, qualified_name: &str, ordinal: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(qualified_name.as_bytes());
    if ordinal > 0 {
        hasher.update(b"\0");
        hasher.update(ordinal.to_string().as_bytes());
    }
    let hex = hasher.finalize().to_hex();
    hex[..20].to_string()
}

/// Normalize one file's extraction. Pure: identical input gives identical output.
pub fn normalize(path: &str, language: &str, extraction: &Extraction) -> NormalizedFile {
    let mut drafts: Vec<&SymbolDraft> = extraction.symbols.iter().collect();
    // Stable: declarations sharing a line keep the extractor's source order
    drafts.sort_by(|a, b| {
        a.start_line
            .cmp(&b.start_line)
            .then(b.end_line.cmp(&a.end_line))
    });
    // The same declaration reported twice (e.g. a re-export) is kept once
    let mut seen = HashSet::new();
    drafts.retain(|&d| seen.insert((d.kind, d.qualified_name.as_str(), d.start_line)));

    let mut ordinals: HashMap<(SymbolKind, &str), usize> = HashMap::new();
    let ids: Vec<String> = drafts
        .iter()
        .map(|&d| {
            let ordinal = ordinals.entry((d.kind, d.qualified_name.as_str())).or_insert(0);
            let id = symbol_id(path, d.kind, &d.qualified_name, *ordinal);
            *ordinal += 1;
            id
        })
        .collect();

    // First declaration wins for name lookups. Export entries only restate
    // names declared elsewhere, so they never own members or references.
    let mut declared: HashMap<&str, usize> = HashMap::new();
    let mut imports: HashMap<&str, usize> = HashMap::new();
    let mut by_simple_name: HashMap<&str, usize> = HashMap::new();
    for (i, &d) in drafts.iter().enumerate() {
        match d.kind {
            SymbolKind::Import => {
                imports.entry(d.qualified_name.as_str()).or_insert(i);
            }
            SymbolKind::Export => {}
            _ => {
                declared.entry(d.qualified_name.as_str()).or_insert(i);
                by_simple_name.entry(d.name.as_str()).or_insert(i);
            }
        }
    }

    let parent_index: Vec<Option<usize>> = drafts
        .iter()
        .map(|d| {
            d.parent
                .as_deref()
                .and_then(|p| declared.get(p).or_else(|| imports.get(p)).copied())
        })
        .collect();

    let mut method_counts = vec![0u32; drafts.len()];
    for (i, d) in drafts.iter().enumerate() {
        if d.kind == SymbolKind::Method {
            if let Some(p) = parent_index[i] {
                if drafts[p].kind.is_class_like() {
                    method_counts[p] += 1;
                }
            }
        }
    }

    let symbols: Vec<Symbol> = drafts
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let parent = parent_index[i].map(|p| drafts[p]);
            build_symbol(
                d,
                ids[i].clone(),
                path,
                language,
                parent_index[i].map(|p| ids[p].clone()),
                parent.map(|p| p.qualified_name.as_str()),
                method_counts[i],
            )
        })
        .collect();

    let mut relationships = Vec::new();
    let mut dropped_references = 0;
    let mut seen_edges = HashSet::new();
    for reference in &extraction.references {
        let from = reference.from.as_deref().and_then(|from| {
            let found = if reference.kind == RelationshipKind::Imports {
                imports.get(from).or_else(|| declared.get(from))
            } else {
                declared.get(from).or_else(|| imports.get(from))
            };
            found.copied()
        });
        let Some(from) = from else {
            dropped_references += 1;
            continue;
        };

        let to_name = if reference.kind == RelationshipKind::Imports {
            reference.target.clone()
        } else {
            last_segment(&reference.target).to_string()
        };
        let to_id = if reference.kind == RelationshipKind::Imports {
            None
        } else {
            by_simple_name.get(to_name.as_str()).map(|&t| ids[t].clone())
        };

        if !seen_edges.insert((from, reference.kind, to_name.clone(), reference.line)) {
            continue;
        }
        relationships.push(Relationship {
            from_id: ids[from].clone(),
            to_id,
            to_name,
            kind: reference.kind,
            file_path: path.to_string(),
            line: reference.line,
        });
    }

    if dropped_references > 0 {
        tracing::debug!("{}: {} module-level references without a source symbol", path, dropped_references);
    }

    NormalizedFile {
        symbols,
        relationships,
        dropped_references,
    }
}

fn build_symbol(
    draft: &SymbolDraft,
    id: String,
    path: &str,
    language: &str,
    parent_id: Option<String>,
    parent_name: Option<&str>,
    method_count: u32,
) -> Symbol {
    let signature = Signature {
        text: signature_text(draft),
        params: draft.params.clone(),
        return_type: draft.return_type.clone(),
    };
    let doc_summary = draft.doc.as_deref().and_then(doc_summary);

    let mut symbol = Symbol {
        id,
        kind: draft.kind,
        name: draft.name.clone(),
        qualified_name: draft.qualified_name.clone(),
        file_path: path.to_string(),
        start_line: draft.start_line,
        end_line: draft.end_line.max(draft.start_line),
        language: language.to_string(),
        signature,
        modifiers: draft.modifiers.clone(),
        decorators: draft.decorators.clone(),
        parent_id,
        doc_summary,
        method_count,
        tiers: Tiers::default(),
    };
    symbol.tiers = render_tiers(&symbol, parent_name, draft.doc.as_deref());
    symbol
}

/// First non-empty doc line, truncated.
pub fn doc_summary(doc: &str) -> Option<String> {
    let first = doc.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(truncate(first, DOC_SUMMARY_CHARS))
}

fn signature_text(draft: &SymbolDraft) -> String {
    let params = draft
        .params
        .iter()
        .map(render_param)
        .collect::<Vec<_>>()
        .join(", ");

    match (draft.kind, &draft.return_type) {
        (SymbolKind::Function | SymbolKind::Method | SymbolKind::Component, ret) => {
            let mut text = format!("{}({})", draft.name, params);
            if let Some(ret) = ret {
                text.push_str(" -> ");
                text.push_str(ret);
            }
            text
        }
        (_, Some(ty)) => format!("{}: {}", draft.name, ty),
        (_, None) => draft.name.clone(),
    }
}

fn render_param(p: &Param) -> String {
    match &p.type_hint {
        Some(t) => format!("{}: {}", p.name, t),
        None => p.name.clone(),
    }
}

/// `models/user.py` for `src/app/models/user.py`.
pub fn short_path(path: &str) -> String {
    let parts: Vec<&str> = path.split(['/', '\\']).filter(|p| !p.is_empty()).collect();
    if parts.len() <= 2 {
        return path.to_string();
    }
    parts[parts.len() - 2..].join("/")
}

fn hook_tags(symbol: &Symbol) -> impl Iterator<Item = &str> {
    symbol
        .decorators
        .iter()
        .filter_map(|d| d.strip_prefix("hook:"))
}

/// Compact: `{kind} {name}({info}) - {short_path}:{line}`.
pub fn compact_line(symbol: &Symbol) -> String {
    let mut info = Vec::new();
    match symbol.kind {
        SymbolKind::Component => {
            info.push(format!("hooks:{}", hook_tags(symbol).count()));
            if symbol.method_count > 0 {
                info.push(format!("m:{}", symbol.method_count));
            }
        }
        kind if kind.is_class_like() => info.push(format!("m:{}", symbol.method_count)),
        kind if kind.is_callable() => info.push(format!("params:{}", symbol.signature.arity())),
        _ => {}
    }
    if symbol.modifiers.contains(&Modifier::Async) {
        info.push("async".to_string());
    }
    if symbol.is_exported() {
        info.push("exp".to_string());
    }

    format!(
        "{} {}({}) - {}:{}",
        symbol.kind,
        truncate(&symbol.name, MAX_NAME_CHARS),
        info.join(", "),
        short_path(&symbol.file_path),
        symbol.start_line
    )
}

/// Each tier begins with the previous one, so costs never decrease.
fn render_tiers(symbol: &Symbol, parent_name: Option<&str>, doc: Option<&str>) -> Tiers {
    let compact = compact_line(symbol);

    let mut summary = vec![compact.clone()];
    let sig = &symbol.signature;
    if sig.text != symbol.name {
        summary.push(format!(
            "Signature: {}",
            truncate(&sig.text, SUMMARY_SIGNATURE_CHARS)
        ));
    }
    let flags: Vec<&str> = symbol.modifiers.iter().map(|m| m.as_str()).collect();
    if !flags.is_empty() {
        summary.push(format!("Modifiers: {}", flags.join(", ")));
    }
    if let Some(parent) = parent_name {
        summary.push(format!("Parent: {}", parent));
    }
    if !sig.params.is_empty() {
        let mut shown: Vec<String> = sig
            .params
            .iter()
            .take(SUMMARY_PARAMS)
            .map(render_param)
            .collect();
        if sig.params.len() > SUMMARY_PARAMS {
            shown.push(format!("... +{} more", sig.params.len() - SUMMARY_PARAMS));
        }
        summary.push(format!("Params: {}", shown.join(", ")));
    }
    let hooks: Vec<&str> = hook_tags(symbol).collect();
    if !hooks.is_empty() {
        summary.push(format!("Hooks: {}", hooks.join(", ")));
    }
    let decorators: Vec<&str> = symbol
        .decorators
        .iter()
        .map(String::as_str)
        .filter(|d| !d.starts_with("hook:"))
        .collect();
    if !decorators.is_empty() {
        let shown: Vec<&str> = decorators.iter().take(SUMMARY_DECORATORS).copied().collect();
        summary.push(format!("Decorators: {}", shown.join(", ")));
    }
    if let Some(doc) = &symbol.doc_summary {
        summary.push(format!("Doc: {}", doc));
    }
    let summary = summary.join("\n");

    let mut full = vec![summary.clone()];
    full.push(format!("Qualified: {}", symbol.qualified_name));
    full.push(format!(
        "Location: {}:{}-{}",
        symbol.file_path, symbol.start_line, symbol.end_line
    ));
    if sig.text.chars().count() > SUMMARY_SIGNATURE_CHARS {
        full.push(format!("Full signature: {}", sig.text));
    }
    if let Some(ret) = &sig.return_type {
        full.push(format!("Returns: {}", ret));
    }
    if decorators.len() > SUMMARY_DECORATORS {
        full.push(format!("All decorators: {}", decorators.join(", ")));
    }
    if let Some(doc) = doc.map(str::trim).filter(|d| !d.is_empty()) {
        if Some(doc) != symbol.doc_summary.as_deref() {
            full.push(format!("Documentation:\n{}", doc));
        }
    }
    let full = full.join("\n");

    Tiers {
        compact_tokens: estimate_tokens(&compact),
        summary_tokens: estimate_tokens(&summary),
        full_tokens: estimate_tokens(&full),
        compact,
        summary,
        full,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

// Index storage and the canonical symbol model

pub mod db;
pub mod schema;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Average characters per token used for every budget estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Deterministic token estimate. Monotone in the character count.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// A named structural unit extracted from source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: String,
    pub kind: SymbolKind,
    pub name: String,
    pub qualified_name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub signature: Signature,
    pub modifiers: BTreeSet<Modifier>,
    pub decorators: Vec<String>,
    pub parent_id: Option<String>,
    pub doc_summary: Option<String>,
    /// Methods owned by a class-like symbol. Zero for everything else.
    pub method_count: u32,
    pub tiers: Tiers,
}

impl Symbol {
    pub fn is_exported(&self) -> bool {
        self.modifiers.contains(&Modifier::Exported)
    }

    pub fn tier_text(&self, tier: Tier) -> &str {
        match tier {
            Tier::Compact => &self.tiers.compact,
            Tier::Summary => &self.tiers.summary,
            Tier::Full => &self.tiers.full,
        }
    }

    pub fn tier_tokens(&self, tier: Tier) -> usize {
        match tier {
            Tier::Compact => self.tiers.compact_tokens,
            Tier::Summary => self.tiers.summary_tokens,
            Tier::Full => self.tiers.full_tokens,
        }
    }
}

/// Symbol kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Class,
    Function,
    Method,
    Interface,
    Struct,
    Module,
    Constant,
    Export,
    Import,
    Component,
}

impl SymbolKind {
    pub const ALL: [SymbolKind; 10] = [
        SymbolKind::Class,
        SymbolKind::Function,
        SymbolKind::Method,
        SymbolKind::Interface,
        SymbolKind::Struct,
        SymbolKind::Module,
        SymbolKind::Constant,
        SymbolKind::Export,
        SymbolKind::Import,
        SymbolKind::Component,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Class => "class",
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Interface => "interface",
            SymbolKind::Struct => "struct",
            SymbolKind::Module => "module",
            SymbolKind::Constant => "constant",
            SymbolKind::Export => "export",
            SymbolKind::Import => "import",
            SymbolKind::Component => "component",
        }
    }

    /// Kinds that own methods and report a method count.
    pub fn is_class_like(&self) -> bool {
        matches!(
            self,
            SymbolKind::Class | SymbolKind::Interface | SymbolKind::Struct | SymbolKind::Component
        )
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Method)
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SymbolKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown symbol kind: {}", s))
    }
}

/// Declaration modifiers. Languages that lack a modifier simply never emit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Async,
    Static,
    Exported,
    Abstract,
    Generator,
    Test,
}

impl Modifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Async => "async",
            Modifier::Static => "static",
            Modifier::Exported => "exported",
            Modifier::Abstract => "abstract",
            Modifier::Generator => "generator",
            Modifier::Test => "test",
        }
    }
}

/// A single declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, type_hint: Option<String>) -> Self {
        Self {
            name: name.into(),
            type_hint,
        }
    }
}

/// Parameter list and declared return type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    /// One-line rendering, e.g. `authenticate(user: str, password) -> bool`.
    pub text: String,
}

impl Signature {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// The three cached representations of a symbol and their token costs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiers {
    pub compact: String,
    pub summary: String,
    pub full: String,
    pub compact_tokens: usize,
    pub summary_tokens: usize,
    pub full_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Compact,
    Summary,
    Full,
}

/// Directed edge between symbols.
///
/// `to_id` is set when the target was resolved inside the same file; otherwise
/// the edge is resolved by `to_name` at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: String,
    pub to_id: Option<String>,
    pub to_name: String,
    pub kind: RelationshipKind,
    pub file_path: String,
    pub line: u32,
}

/// Relationship kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Calls,
    Imports,
    Extends,
    Implements,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::Calls => "calls",
            RelationshipKind::Imports => "imports",
            RelationshipKind::Extends => "extends",
            RelationshipKind::Implements => "implements",
        }
    }
}

impl FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calls" => Ok(RelationshipKind::Calls),
            "imports" => Ok(RelationshipKind::Imports),
            "extends" => Ok(RelationshipKind::Extends),
            "implements" => Ok(RelationshipKind::Implements),
            _ => Err(format!("unknown relationship kind: {}", s)),
        }
    }
}

/// Which end of a relationship a lookup starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Per-file metadata. `symbol_ids` is ordered by start line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub language: String,
    pub size: u64,
    /// Modification time in seconds, used only as a pre-filter.
    pub mtime: i64,
    pub line_count: u32,
    pub last_indexed_at: i64,
    pub symbol_ids: Vec<String>,
}

/// Content hash used for change detection.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_kind_round_trip_through_str() {
        for kind in SymbolKind::ALL {
            assert_eq!(kind.as_str().parse::<SymbolKind>().unwrap(), kind);
        }
        assert!("enum".parse::<SymbolKind>().is_err());
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"x = 1\n"), content_hash(b"x = 1\n"));
        assert_ne!(content_hash(b"x = 1\n"), content_hash(b"x = 2\n"));
    }
}

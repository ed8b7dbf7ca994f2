// Pattern-based intent classification for free-text queries

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// What a query asks for, with the extracted target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "intent", rename_all = "lowercase")]
pub enum Intent {
    Find { name: String },
    Dependencies { file: String },
    Callers { name: String },
    Exports,
    Overview,
    Detail { name: String },
    File { path: String },
    Search { terms: String },
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Find { .. } => "find",
            Intent::Dependencies { .. } => "dependencies",
            Intent::Callers { .. } => "callers",
            Intent::Exports => "exports",
            Intent::Overview => "overview",
            Intent::Detail { .. } => "detail",
            Intent::File { .. } => "file",
            Intent::Search { .. } => "search",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Intent::Find { name } | Intent::Callers { name } | Intent::Detail { name } => Some(name),
            Intent::Dependencies { file } => Some(file),
            Intent::File { path } => Some(path),
            Intent::Search { terms } => Some(terms),
            Intent::Exports | Intent::Overview => None,
        }
    }
}

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).expect("valid regex"))
        .collect()
}

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*["'`]([\w.:$-]+)["'`]\s*$"#).expect("valid regex"));

static FIND: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r#"\bfind\s+(?:the\s+)?["'`]?([\w.:$]+)"#,
        r#"\bwhere\s+is\s+(?:the\s+)?["'`]?([\w.:$]+)"#,
        r#"\blocate\s+(?:the\s+)?["'`]?([\w.:$]+)"#,
        r#"\bshow\s+me\s+(?:the\s+)?["'`]?([\w.:$]+)"#,
        r#"\blook\s+for\s+(?:the\s+)?["'`]?([\w.:$]+)"#,
        r#"\bsearch\s+for\s+(?:the\s+)?["'`]?([\w.:$]+)"#,
    ])
});

/// Words that follow a find verb without naming anything.
const FIND_FILLERS: &[&str] = &[
    "the", "a", "an", "all", "any", "some", "function", "functions", "class", "classes",
    "method", "methods", "component", "components", "everything", "where", "what",
];

static DEPENDENCIES: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"\bwhat\s+does\s+([^\s?]+)\s+(?:depend|import|use|require)",
        r"\bwhat\s+(?:are|does)\s+([^\s?]+)\s+imports?\b",
        r"([^\s?]+\.[A-Za-z]{1,5})\s+depend",
        r"\bdependencies\s+(?:of|for|in)\s+([^\s?]+)",
        r"\bdeps\s+(?:of|for|in)\s+([^\s?]+)",
        r"\bimports?\s+(?:of|for|in)\s+([^\s?]+)",
    ])
});

static CALLERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"\b(?:who|what)\s+calls\s+([\w.:$]+)",
        r"\bcallers\s+(?:of|for)\s+([\w.:$]+)",
        r"\bcall\s+chain\s+(?:for\s+|of\s+)?([\w.:$]+)",
        r"\bcalled\s+by\s+([\w.:$]+)",
        r"\bcalls\s+(?:to\s+)?([\w.:$]+)",
        r"([\w.:$]+)\s+call\s+chain\b",
    ])
});

static EXPORTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"\bexports\b",
        r"\bexported\s+(?:symbols|functions|classes|components|api)\b",
        r"\blist\s+(?:all\s+)?(?:exported|public)\b",
        r"\bpublic\s+(?:api|interface)\b",
    ])
});

static OVERVIEW: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"\boverview\b",
        r"\bsummary\b",
        r"\barchitecture\b",
        r"\bstructure\s+of\s+(?:the\s+)?(?:codebase|project|repo)",
        r"\bwhat\s+is\s+this\b",
    ])
});

static DETAIL: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"\bdetails?\s+(?:for\s+|about\s+|of\s+|on\s+)?([\w.:$]+)",
        r"\bexplain\s+(?:the\s+)?([\w.:$]+)",
        r"\bdescribe\s+(?:the\s+)?([\w.:$]+)",
        r"\btell\s+me\s+about\s+(?:the\s+)?([\w.:$]+)",
        r"\binfo\s+(?:on|about)\s+([\w.:$]+)",
    ])
});

static FILE: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r"\bfile\s+([^\s?]+)",
        r"\bshow\s+([^\s?]+\.[A-Za-z]{1,5})\b",
        r"\bcomponents?\s+in\s+([^\s?]+)",
        r"\bsymbols\s+in\s+([^\s?]+)",
        r"\bin\s+([^\s?]+\.[A-Za-z]{1,5})\b",
    ])
});

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "must",
    "shall", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "under", "again",
    "further", "then", "once", "here", "there", "when", "where", "why", "how", "all", "each",
    "every", "both", "few", "more", "most", "other", "some", "such", "no", "nor", "not",
    "only", "own", "same", "so", "than", "too", "very", "just", "and", "or", "but", "if",
    "because", "until", "while", "about", "find", "show", "list", "get", "search", "locate",
    "look", "display", "give", "tell", "what", "which", "who", "whom", "this", "that",
    "these", "those", "me", "my", "your", "code", "any",
];

const MIN_TERM_CHARS: usize = 3;

/// Classify a query. Never fails: anything unrecognised becomes a search.
pub fn plan(query: &str) -> Intent {
    let query = query.trim();

    if let Some(caps) = QUOTED.captures(query) {
        return Intent::Find {
            name: caps[1].to_string(),
        };
    }

    for re in FIND.iter() {
        if let Some(caps) = re.captures(query) {
            let target = caps[1].trim_end_matches(['.', ':']);
            if !target.is_empty() && !FIND_FILLERS.contains(&target.to_ascii_lowercase().as_str()) {
                return Intent::Find {
                    name: target.to_string(),
                };
            }
        }
    }

    if let Some(file) = first_capture(&DEPENDENCIES, query) {
        return Intent::Dependencies { file };
    }
    if let Some(name) = first_capture(&CALLERS, query) {
        return Intent::Callers { name };
    }
    if EXPORTS.iter().any(|re| re.is_match(query)) {
        return Intent::Exports;
    }
    if OVERVIEW.iter().any(|re| re.is_match(query)) {
        return Intent::Overview;
    }
    if let Some(name) = first_capture(&DETAIL, query) {
        return Intent::Detail { name };
    }
    if let Some(path) = first_capture(&FILE, query) {
        return Intent::File { path };
    }

    let terms = search_terms(query);
    Intent::Search {
        terms: if terms.is_empty() {
            query.to_string()
        } else {
            terms.join(" ")
        },
    }
}

fn first_capture(patterns: &[Regex], query: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        let caps = re.captures(query)?;
        let target = caps[1].trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | ',' | '?'));
        if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        }
    })
}

/// Meaningful words of a query: stop words and short words removed.
pub fn search_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_TERM_CHARS && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn find(name: &str) -> Intent {
        Intent::Find {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_find_patterns_keep_case() {
        assert_eq!(plan("find UserProfile"), find("UserProfile"));
        assert_eq!(plan("Where is the authenticate function"), find("authenticate"));
        assert_eq!(plan("search for SessionStore"), find("SessionStore"));
        assert_eq!(plan("\"UserProfile\""), find("UserProfile"));
        assert_eq!(plan("find `parse_config`"), find("parse_config"));
    }

    #[test]
    fn test_find_skips_filler_words() {
        // "find all" names nothing, so later patterns get a chance
        assert_eq!(plan("find all exports"), Intent::Exports);
    }

    #[test]
    fn test_dependency_patterns() {
        let deps = |f: &str| Intent::Dependencies {
            file: f.to_string(),
        };
        assert_eq!(plan("dependencies of auth.py"), deps("auth.py"));
        assert_eq!(plan("what does src/auth.py import?"), deps("src/auth.py"));
        assert_eq!(plan("What does database.py depend on"), deps("database.py"));
        assert_eq!(plan("imports in utils.ts"), deps("utils.ts"));
    }

    #[test]
    fn test_callers_patterns() {
        let callers = |n: &str| Intent::Callers {
            name: n.to_string(),
        };
        assert_eq!(plan("what calls authenticate"), callers("authenticate"));
        assert_eq!(plan("callers of process_payment"), callers("process_payment"));
        assert_eq!(plan("call chain for handle"), callers("handle"));
        assert_eq!(plan("who calls save?"), callers("save"));
    }

    #[test]
    fn test_exports_and_overview() {
        assert_eq!(plan("exports"), Intent::Exports);
        assert_eq!(plan("show the public API"), Intent::Exports);
        assert_eq!(plan("overview"), Intent::Overview);
        assert_eq!(plan("give me a codebase summary"), Intent::Overview);
    }

    #[test]
    fn test_detail_and_file() {
        assert_eq!(
            plan("explain UserProfile"),
            Intent::Detail {
                name: "UserProfile".to_string()
            }
        );
        assert_eq!(
            plan("tell me about login"),
            Intent::Detail {
                name: "login".to_string()
            }
        );
        assert_eq!(
            plan("show src/auth.py"),
            Intent::File {
                path: "src/auth.py".to_string()
            }
        );
        assert_eq!(
            plan("components in web/App.tsx"),
            Intent::File {
                path: "web/App.tsx".to_string()
            }
        );
    }

    #[test]
    fn test_fallback_extracts_terms() {
        assert_eq!(
            plan("how is the payment retry handled"),
            Intent::Search {
                terms: "payment retry handled".to_string()
            }
        );
        // Nothing survives filtering: the raw text is searched
        assert_eq!(
            plan("is it ok"),
            Intent::Search {
                terms: "is it ok".to_string()
            }
        );
    }

    #[test]
    fn test_search_terms() {
        assert_eq!(
            search_terms("Where do we validate JWT tokens?"),
            vec!["validate", "jwt", "tokens"]
        );
        assert!(search_terms("a to be").is_empty());
    }

    #[test]
    fn test_intent_names_and_targets() {
        assert_eq!(plan("exports").name(), "exports");
        assert_eq!(plan("exports").target(), None);
        assert_eq!(plan("find User").target(), Some("User"));
    }
}

use once_cell::sync::Lazy;
use regex::Regex;

use super::{extension_of, Extraction, Extractor, SymbolDraft};
use crate::error::Result;
use crate::index::{Param, RelationshipKind, SymbolKind};

/// Pattern extractor for Jinja2/Django, Handlebars and EJS templates.
///
/// Emits the file as a module and named blocks (Jinja blocks, Handlebars
/// inline partials) as nested modules: they are overridable regions of the
/// page, not UI components. Macros become functions. Include/extends become
/// edges. No expression analysis.
pub struct TemplateExtractor;

static BLOCK_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%-?\s*block\s+(\w+)").expect("valid regex"));
static BLOCK_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%-?\s*endblock\b").expect("valid regex"));
static MACRO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%-?\s*macro\s+(\w+)\s*\(([^)]*)\)").expect("valid regex"));
static MACRO_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{%-?\s*endmacro\b").expect("valid regex"));
static INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{%-?\s*(?:include|import|from)\s+["']([^"']+)["']"#).expect("valid regex")
});
static EXTENDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{%-?\s*extends\s+["']([^"']+)["']"#).expect("valid regex"));
static HBS_PARTIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\{>\s*["']?([\w./-]+)"#).expect("valid regex"));
static HBS_INLINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\{#\*\s*inline\s+["']([^"']+)["']"#).expect("valid regex"));
static EJS_INCLUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<%[-=]?\s*include\(\s*["']([^"']+)["']"#).expect("valid regex"));

const SNIFF_MARKERS: &[&str] = &["{%", "{{", "<%"];

impl Extractor for TemplateExtractor {
    fn language(&self) -> &'static str {
        "template"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[
            "html", "htm", "jinja", "jinja2", "j2", "hbs", "handlebars", "ejs", "njk", "twig",
        ]
    }

    fn applies_to(&self, path: &str, content: &str) -> bool {
        match extension_of(path).as_deref() {
            Some("html") | Some("htm") => SNIFF_MARKERS.iter().any(|m| content.contains(m)),
            Some(ext) => self.extensions().contains(&ext),
            None => false,
        }
    }

    fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
        let index = LineIndex::new(content);
        let module = module_name(path);
        let mut out = Extraction::default();

        out.push(SymbolDraft::new(
            SymbolKind::Module,
            module.clone(),
            module.clone(),
            1,
            index.line_count(),
        ));

        // Blocks nest; pair each endblock with the innermost open block
        let mut events: Vec<(usize, Option<String>)> = BLOCK_OPEN
            .captures_iter(content)
            .filter_map(|c| Some((c.get(0)?.start(), Some(c[1].to_string()))))
            .chain(BLOCK_CLOSE.find_iter(content).map(|m| (m.start(), None)))
            .collect();
        events.sort_by_key(|(offset, _)| *offset);

        let mut open: Vec<(String, u32)> = Vec::new();
        let mut unclosed = false;
        for (offset, event) in events {
            let line = index.line_of(offset);
            match event {
                Some(name) => open.push((name, line)),
                None => match open.pop() {
                    Some((name, start)) => {
                        let parent = open
                            .last()
                            .map(|(p, _)| format!("{}.{}", module, p))
                            .unwrap_or_else(|| module.clone());
                        out.push(
                            SymbolDraft::new(
                                SymbolKind::Module,
                                name.clone(),
                                format!("{}.{}", module, name),
                                start,
                                line,
                            )
                            .with_parent(Some(&parent)),
                        );
                    }
                    None => unclosed = true,
                },
            }
        }
        // Unterminated blocks run to end of file
        for (name, start) in open.drain(..) {
            unclosed = true;
            out.push(
                SymbolDraft::new(
                    SymbolKind::Module,
                    name.clone(),
                    format!("{}.{}", module, name),
                    start,
                    index.line_count(),
                )
                .with_parent(Some(&module)),
            );
        }
        if unclosed {
            out.partial = Some("unbalanced block tags".to_string());
        }

        let closes: Vec<usize> = MACRO_CLOSE.find_iter(content).map(|m| m.start()).collect();
        for caps in MACRO.captures_iter(content) {
            let Some(whole) = caps.get(0) else { continue };
            let start = index.line_of(whole.start());
            let end = closes
                .iter()
                .find(|&&c| c > whole.start())
                .map(|&c| index.line_of(c))
                .unwrap_or(start);
            let mut draft = SymbolDraft::new(
                SymbolKind::Function,
                &caps[1],
                format!("{}.{}", module, &caps[1]),
                start,
                end,
            )
            .with_parent(Some(&module));
            draft.params = caps[2]
                .split(',')
                .map(|p| p.split('=').next().unwrap_or("").trim())
                .filter(|p| !p.is_empty())
                .map(|p| Param::new(p, None))
                .collect();
            out.push(draft);
        }

        for caps in HBS_INLINE.captures_iter(content) {
            let Some(whole) = caps.get(0) else { continue };
            let line = index.line_of(whole.start());
            out.push(
                SymbolDraft::new(
                    SymbolKind::Module,
                    &caps[1],
                    format!("{}.{}", module, &caps[1]),
                    line,
                    line,
                )
                .with_parent(Some(&module)),
            );
        }

        for caps in EXTENDS.captures_iter(content) {
            let Some(whole) = caps.get(0) else { continue };
            out.reference(
                Some(&module),
                &caps[1],
                RelationshipKind::Extends,
                index.line_of(whole.start()),
            );
        }

        let mut includes: Vec<(usize, String)> = [&*INCLUDE, &*HBS_PARTIAL, &*EJS_INCLUDE]
            .iter()
            .flat_map(|re| {
                re.captures_iter(content)
                    .filter_map(|c| Some((c.get(0)?.start(), c[1].to_string())))
                    .collect::<Vec<_>>()
            })
            .collect();
        includes.sort();
        for (offset, target) in includes {
            let line = index.line_of(offset);
            out.push(
                SymbolDraft::new(SymbolKind::Import, target.clone(), target.clone(), line, line)
                    .with_parent(Some(&module)),
            );
            out.reference(Some(&target), target.clone(), RelationshipKind::Imports, line);
        }

        Ok(out)
    }
}

/// `templates/account/profile.html` gives `profile`.
fn module_name(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    file.split('.').next().unwrap_or(file).to_string()
}

/// Byte offset to 1-based line lookup.
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(content: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(content.match_indices('\n').map(|(i, _)| i + 1));
        if content.ends_with('\n') {
            starts.pop();
        }
        Self { starts }
    }

    pub(crate) fn line_of(&self, offset: usize) -> u32 {
        match self.starts.binary_search(&offset) {
            Ok(i) => i as u32 + 1,
            Err(i) => i as u32,
        }
    }

    pub(crate) fn line_count(&self) -> u32 {
        self.starts.len() as u32
    }
}

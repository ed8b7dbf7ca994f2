// Query execution: intent dispatch, token budgeting and pagination

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::intent::{plan, Intent};
use crate::config::QueryConfig;
use crate::error::{AtlasError, Result, StoreError};
use crate::index::db::{IndexStats, IndexStore, Page};
use crate::index::{
    estimate_tokens, Direction, Relationship, RelationshipKind, Symbol, Tier, CHARS_PER_TOKEN,
};
use crate::indexer::normalize::short_path;

/// Rough per-result cost used to size the candidate page.
const TOKENS_PER_RESULT: usize = 50;
const MIN_FETCH: usize = 10;
const MAX_FETCH: usize = 500;
const OVERVIEW_SAMPLE: usize = 40;
const CACHE_CAPACITY: usize = 256;

/// One entry of a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_id: Option<String>,
    pub kind: String,
    pub name: String,
    pub file_path: String,
    pub line: u32,
    pub tier: Tier,
    pub text: String,
    pub tokens: usize,
    /// Relationship target for dependency and call-chain entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ResultItem {
    fn from_symbol(symbol: &Symbol, tier: Tier) -> Self {
        Self {
            symbol_id: Some(symbol.id.clone()),
            kind: symbol.kind.to_string(),
            name: symbol.name.clone(),
            file_path: symbol.file_path.clone(),
            line: symbol.start_line,
            tier,
            text: symbol.tier_text(tier).to_string(),
            tokens: symbol.tier_tokens(tier),
            target: None,
        }
    }

    fn from_edge(edge: &Relationship, label: &str) -> Self {
        let text = format!(
            "{} {} - {}:{}",
            label,
            edge.to_name,
            short_path(&edge.file_path),
            edge.line
        );
        Self {
            symbol_id: None,
            kind: edge.kind.as_str().to_string(),
            name: edge.to_name.clone(),
            file_path: edge.file_path.clone(),
            line: edge.line,
            tier: Tier::Compact,
            tokens: estimate_tokens(&text),
            text,
            target: Some(edge.to_name.clone()),
        }
    }
}

/// Structured answer to a query. Rendering is left to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub intent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Leading text block (overview statistics, resolved file).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub results: Vec<ResultItem>,
    /// Secondary entries outside pagination, e.g. what a function itself calls.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<ResultItem>,
    pub shown: usize,
    pub total: usize,
    /// Results not in this response: before `offset` or beyond the budget.
    pub withheld: usize,
    pub next_offset: Option<usize>,
    pub tokens_used: usize,
    pub max_tokens: usize,
    /// Estimated tokens of reading the referenced files whole.
    pub baseline_tokens: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    pub cached: bool,
}

impl QueryResponse {
    pub(crate) fn new(query: &str, intent: &Intent, max_tokens: usize) -> Self {
        Self {
            query: query.to_string(),
            intent: intent.name().to_string(),
            target: intent.target().map(str::to_string),
            header: None,
            results: Vec::new(),
            related: Vec::new(),
            shown: 0,
            total: 0,
            withheld: 0,
            next_offset: None,
            tokens_used: 0,
            max_tokens,
            baseline_tokens: 0,
            suggestions: Vec::new(),
            cached: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn tokens_saved(&self) -> usize {
        self.baseline_tokens.saturating_sub(self.tokens_used)
    }
}

/// Greedy tier assembly over an ordered candidate list.
///
/// Every candidate enters at compact tier while it fits; the first one that
/// does not fit ends the page so `next_offset` stays contiguous. Shown items
/// are then upgraded to summary, in order, while the total stays in budget.
struct Budget {
    limit: usize,
    used: usize,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    fn take(&mut self, tokens: usize) -> bool {
        if self.used + tokens <= self.limit {
            self.used += tokens;
            true
        } else {
            false
        }
    }

    fn select(&mut self, symbols: &[Symbol]) -> Vec<ResultItem> {
        let mut shown: Vec<&Symbol> = Vec::new();
        for symbol in symbols {
            if !self.take(symbol.tier_tokens(Tier::Compact)) {
                break;
            }
            shown.push(symbol);
        }

        shown
            .into_iter()
            .map(|symbol| {
                let compact = symbol.tier_tokens(Tier::Compact);
                let extra = symbol.tier_tokens(Tier::Summary).saturating_sub(compact);
                if extra > 0 && self.take(extra) {
                    ResultItem::from_symbol(symbol, Tier::Summary)
                } else {
                    ResultItem::from_symbol(symbol, Tier::Compact)
                }
            })
            .collect()
    }

    fn select_items(&mut self, items: Vec<ResultItem>) -> Vec<ResultItem> {
        let mut shown = Vec::new();
        for item in items {
            if !self.take(item.tokens) {
                break;
            }
            shown.push(item);
        }
        shown
    }
}

struct CacheEntry {
    generation: u64,
    stored_at: Instant,
    response: QueryResponse,
}

/// Query planner and executor over an [`IndexStore`].
pub struct QueryEngine {
    store: IndexStore,
    config: QueryConfig,
    cache_enabled: bool,
    cache: Mutex<HashMap<(String, usize, usize), CacheEntry>>,
}

impl QueryEngine {
    pub fn new(store: IndexStore, config: QueryConfig, cache_enabled: bool) -> Self {
        Self {
            store,
            config,
            cache_enabled,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn default_max_tokens(&self) -> usize {
        self.config.default_max_tokens
    }

    /// Classify `text` and answer it within `max_tokens`.
    pub fn query(&self, text: &str, max_tokens: Option<usize>, offset: usize) -> Result<QueryResponse> {
        let max_tokens = max_tokens.unwrap_or(self.config.default_max_tokens);
        let key = (text.trim().to_string(), max_tokens, offset);
        let generation = self
            .store
            .generation()
            .map_err(|e| AtlasError::store("*", "generation", e))?;

        if let Some(hit) = self.cached(&key, generation) {
            return Ok(hit);
        }

        let intent = plan(text);
        debug!("Query '{}' classified as {:?}", text, intent);
        let mut response = self.execute(text, &intent, max_tokens, offset)?;
        self.finish(&mut response, offset)?;

        if self.cache_enabled {
            let mut cache = self.cache.lock();
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
            cache.insert(
                key,
                CacheEntry {
                    generation,
                    stored_at: Instant::now(),
                    response: response.clone(),
                },
            );
        }
        Ok(response)
    }

    /// Direct name lookup, bypassing classification.
    pub fn find(&self, name: &str, limit: usize, offset: usize) -> Result<QueryResponse> {
        let intent = Intent::Find {
            name: name.to_string(),
        };
        let max_tokens = self.config.default_max_tokens;
        let page = self
            .store
            .find_by_name(name, limit, offset)
            .map_err(|e| AtlasError::store("*", "find_by_name", e))?;

        let mut response = QueryResponse::new(name, &intent, max_tokens);
        page_into(&mut response, page, max_tokens);
        self.finish(&mut response, offset)?;
        Ok(response)
    }

    /// Symbols of one file in line order.
    pub fn show(&self, path: &str, max_tokens: Option<usize>, offset: usize) -> Result<QueryResponse> {
        let max_tokens = max_tokens.unwrap_or(self.config.default_max_tokens);
        let intent = Intent::File {
            path: path.to_string(),
        };
        let mut response = self.file_symbols(path, &intent, max_tokens, offset)?;
        self.finish(&mut response, offset)?;
        Ok(response)
    }

    pub fn exports(&self, limit: usize, offset: usize) -> Result<QueryResponse> {
        let max_tokens = self.config.default_max_tokens;
        let page = self
            .store
            .list_exports(limit, offset)
            .map_err(|e| AtlasError::store("*", "list_exports", e))?;
        let mut response = QueryResponse::new("exports", &Intent::Exports, max_tokens);
        page_into(&mut response, page, max_tokens);
        self.finish(&mut response, offset)?;
        Ok(response)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.store
            .stats()
            .map_err(|e| AtlasError::store("*", "stats", e))
    }

    fn cached(&self, key: &(String, usize, usize), generation: u64) -> Option<QueryResponse> {
        if !self.cache_enabled {
            return None;
        }
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.generation == generation && entry.stored_at.elapsed() < ttl => {
                let mut response = entry.response.clone();
                response.cached = true;
                Some(response)
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn fetch_limit(&self, max_tokens: usize) -> usize {
        (max_tokens / TOKENS_PER_RESULT).clamp(MIN_FETCH, MAX_FETCH)
    }

    fn execute(
        &self,
        text: &str,
        intent: &Intent,
        max_tokens: usize,
        offset: usize,
    ) -> Result<QueryResponse> {
        let limit = self.fetch_limit(max_tokens);
        let store_err = |op: &'static str| move |e: StoreError| AtlasError::store("*", op, e);

        let mut response = match intent {
            Intent::Find { name } => {
                let page = self
                    .store
                    .find_by_name(name, limit, offset)
                    .map_err(store_err("find_by_name"))?;
                let mut response = QueryResponse::new(text, intent, max_tokens);
                page_into(&mut response, page, max_tokens);
                response
            }
            Intent::Dependencies { file } => self.dependencies(text, intent, file, max_tokens, offset)?,
            Intent::Callers { name } => self.callers(text, intent, name, max_tokens, offset)?,
            Intent::Exports => {
                let page = self
                    .store
                    .list_exports(limit, offset)
                    .map_err(store_err("list_exports"))?;
                let mut response = QueryResponse::new(text, intent, max_tokens);
                page_into(&mut response, page, max_tokens);
                response
            }
            Intent::Overview => self.overview(text, intent, max_tokens, offset)?,
            Intent::Detail { name } => self.detail(text, intent, name, max_tokens)?,
            Intent::File { path } => {
                let mut response = self.file_symbols(path, intent, max_tokens, offset)?;
                response.query = text.to_string();
                response
            }
            Intent::Search { terms } => {
                let page = self
                    .store
                    .full_text_search(terms, limit, offset)
                    .map_err(store_err("full_text_search"))?;
                let mut response = QueryResponse::new(text, intent, max_tokens);
                page_into(&mut response, page, max_tokens);
                response
            }
        };

        if response.is_empty() {
            response.suggestions = suggestions(intent);
        }
        Ok(response)
    }

    fn dependencies(
        &self,
        text: &str,
        intent: &Intent,
        fragment: &str,
        max_tokens: usize,
        offset: usize,
    ) -> Result<QueryResponse> {
        let mut response = QueryResponse::new(text, intent, max_tokens);
        let Some(path) = self
            .store
            .resolve_file(fragment)
            .map_err(|e| AtlasError::store(fragment, "resolve_file", e))?
        else {
            return Ok(response);
        };

        let edges = self
            .store
            .file_dependencies(&path)
            .map_err(|e| AtlasError::store(path.as_str(), "file_dependencies", e))?;
        let items: Vec<ResultItem> = edges
            .iter()
            .map(|edge| ResultItem::from_edge(edge, "imports"))
            .collect();

        response.header = Some(format!("Dependencies of {}", path));
        items_into(&mut response, items, offset, max_tokens);
        Ok(response)
    }

    fn callers(
        &self,
        text: &str,
        intent: &Intent,
        name: &str,
        max_tokens: usize,
        offset: usize,
    ) -> Result<QueryResponse> {
        let mut response = QueryResponse::new(text, intent, max_tokens);
        let simple = name.rsplit(['.', ':']).next().unwrap_or(name);

        let sites = self
            .store
            .callers_of(simple)
            .map_err(|e| AtlasError::store("*", "callers_of", e))?;
        let callers: Vec<Symbol> = sites.into_iter().map(|site| site.caller).collect();

        let mut budget = Budget::new(max_tokens);
        response.total = callers.len();
        let window = callers.get(offset..).unwrap_or(&[]);
        response.results = budget.select(window);

        // The target's own outgoing calls, while budget remains
        if offset == 0 {
            let target = self
                .store
                .find_by_name(simple, 1, 0)
                .map_err(|e| AtlasError::store("*", "find_by_name", e))?;
            if let Some(symbol) = target.items.first().filter(|s| s.name == simple) {
                let edges = self
                    .store
                    .relationships_of(&symbol.id, Direction::Outgoing, Some(RelationshipKind::Calls))
                    .map_err(|e| AtlasError::store(symbol.file_path.as_str(), "relationships_of", e))?;
                let items = edges.iter().map(|e| ResultItem::from_edge(e, "calls")).collect();
                response.related = budget.select_items(items);
            }
        }

        response.tokens_used = budget.used;
        Ok(response)
    }

    fn overview(
        &self,
        text: &str,
        intent: &Intent,
        max_tokens: usize,
        offset: usize,
    ) -> Result<QueryResponse> {
        let stats = self.stats()?;
        let mut response = QueryResponse::new(text, intent, max_tokens);

        let mut lines = vec![
            "Codebase overview".to_string(),
            format!(
                "files: {} | lines: {} | symbols: {} | exported: {} | tests: {}",
                stats.files, stats.total_lines, stats.symbols, stats.exported, stats.tests
            ),
        ];
        let languages: Vec<String> = stats
            .by_language
            .iter()
            .take(10)
            .map(|(lang, n)| format!("{} {}", lang, n))
            .collect();
        if !languages.is_empty() {
            lines.push(format!("languages: {}", languages.join(", ")));
        }
        let kinds: Vec<String> = stats
            .by_kind
            .iter()
            .map(|(kind, n)| format!("{} {}", kind, n))
            .collect();
        if !kinds.is_empty() {
            lines.push(format!("kinds: {}", kinds.join(", ")));
        }

        let mut header = lines.join("\n");
        let mut header_tokens = estimate_tokens(&header);
        if header_tokens > max_tokens {
            header = lines[0].clone();
            header_tokens = estimate_tokens(&header);
        }
        if header_tokens <= max_tokens {
            response.header = Some(header);
        } else {
            header_tokens = 0;
        }

        let sample = self
            .store
            .top_level_symbols(OVERVIEW_SAMPLE)
            .map_err(|e| AtlasError::store("*", "top_level_symbols", e))?;
        let mut budget = Budget::new(max_tokens);
        budget.used = header_tokens;
        response.total = sample.len();
        response.results = budget.select(sample.get(offset..).unwrap_or(&[]));
        response.tokens_used = budget.used;
        Ok(response)
    }

    /// Best match at full tier, stepping down a tier when it does not fit.
    fn detail(&self, text: &str, intent: &Intent, name: &str, max_tokens: usize) -> Result<QueryResponse> {
        let mut response = QueryResponse::new(text, intent, max_tokens);
        let page = self
            .store
            .find_by_name(name, 1, 0)
            .map_err(|e| AtlasError::store("*", "find_by_name", e))?;
        let Some(symbol) = page.items.into_iter().next() else {
            return Ok(response);
        };

        response.total = 1;
        let tier = [Tier::Full, Tier::Summary, Tier::Compact]
            .into_iter()
            .find(|&t| symbol.tier_tokens(t) <= max_tokens);
        if let Some(tier) = tier {
            let item = ResultItem::from_symbol(&symbol, tier);
            response.tokens_used = item.tokens;
            response.results.push(item);
        }
        Ok(response)
    }

    fn file_symbols(
        &self,
        fragment: &str,
        intent: &Intent,
        max_tokens: usize,
        offset: usize,
    ) -> Result<QueryResponse> {
        let mut response = QueryResponse::new(fragment, intent, max_tokens);
        let Some(path) = self
            .store
            .resolve_file(fragment)
            .map_err(|e| AtlasError::store(fragment, "resolve_file", e))?
        else {
            response.suggestions = suggestions(intent);
            return Ok(response);
        };

        let symbols = self
            .store
            .symbols_in_file(&path)
            .map_err(|e| AtlasError::store(path.as_str(), "symbols_in_file", e))?;

        let mut budget = Budget::new(max_tokens);
        response.total = symbols.len();
        response.results = budget.select(symbols.get(offset..).unwrap_or(&[]));
        response.tokens_used = budget.used;
        response.header = Some(path);
        Ok(response)
    }

    /// Fill pagination counters and the baseline cost of the files touched.
    fn finish(&self, response: &mut QueryResponse, offset: usize) -> Result<()> {
        response.shown = response.results.len();
        response.withheld = response.total.saturating_sub(response.shown);
        let end = offset + response.shown;
        response.next_offset = (end < response.total).then_some(end);

        let files: BTreeSet<&str> = response
            .results
            .iter()
            .chain(response.related.iter())
            .map(|r| r.file_path.as_str())
            .collect();
        let mut baseline = 0;
        for path in files {
            if let Some(record) = self
                .store
                .get_file(path)
                .map_err(|e| AtlasError::store(path, "get_file", e))?
            {
                baseline += (record.size as usize).div_ceil(CHARS_PER_TOKEN);
            }
        }
        response.baseline_tokens = baseline;
        Ok(())
    }
}

fn page_into(response: &mut QueryResponse, page: Page<Symbol>, max_tokens: usize) {
    let mut budget = Budget::new(max_tokens);
    response.total = page.total;
    response.results = budget.select(&page.items);
    response.tokens_used = budget.used;
}

fn items_into(response: &mut QueryResponse, items: Vec<ResultItem>, offset: usize, max_tokens: usize) {
    let mut budget = Budget::new(max_tokens);
    response.total = items.len();
    let window: Vec<ResultItem> = items.into_iter().skip(offset).collect();
    response.results = budget.select_items(window);
    response.tokens_used = budget.used;
}

fn suggestions(intent: &Intent) -> Vec<String> {
    let mut out = Vec::new();
    match intent {
        Intent::Find { name } | Intent::Detail { name } | Intent::Callers { name } => {
            out.push(format!("search {}", name));
        }
        Intent::Dependencies { file } | Intent::File { path: file } => {
            out.push(format!("find {}", file.rsplit('/').next().unwrap_or(file)));
        }
        _ => {}
    }
    out.extend(
        ["find <name>", "show <file>", "exports", "overview"]
            .iter()
            .map(|s| s.to_string()),
    );
    out
}

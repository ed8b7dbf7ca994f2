// Update coordinator: scanning, bounded parallel extraction, per-file apply

pub mod changes;
pub mod normalize;
pub mod parser;
pub mod watcher;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use self::changes::{diff, ChangeSet, SourceFile, SourceTree};
use self::normalize::normalize;
use self::parser::{Extraction, ExtractorRegistry};
use crate::config::IndexingConfig;
use crate::error::{AtlasError, Result};
use crate::index::db::{now, IndexStore};
use crate::index::{content_hash, FileRecord};

/// Coordinator lifecycle. Only one run moves through these states at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Scanning,
    Dispatching,
    Applying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Incremental,
    Paths,
}

/// Outcome of one coordinator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub mode: RunMode,
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Files whose extraction failed; their previous entries were kept.
    pub failed: usize,
    /// Files indexed from a partial (syntax-error) extraction.
    pub partial: usize,
    pub skipped_oversize: usize,
    /// Candidate files no extractor claims, such as HTML without template
    /// syntax. Not failures; any earlier entry is removed.
    pub skipped_unclaimed: usize,
    pub symbols: usize,
    pub relationships: usize,
    pub dropped_references: usize,
    pub failures: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunStats {
    pub(crate) fn new(mode: RunMode) -> Self {
        Self {
            mode,
            scanned: 0,
            indexed: 0,
            unchanged: 0,
            deleted: 0,
            failed: 0,
            partial: 0,
            skipped_oversize: 0,
            skipped_unclaimed: 0,
            symbols: 0,
            relationships: 0,
            dropped_references: 0,
            failures: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Warnings surfaced to the caller: failures plus partial extractions.
    pub fn warnings(&self) -> usize {
        self.failed + self.partial
    }
}

/// Called with (completed, total) as extraction results arrive.
pub type ProgressHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Extraction result for one file, produced off the async runtime.
struct Extracted {
    file: SourceFile,
    language: &'static str,
    hash: String,
    line_count: u32,
    extraction: Extraction,
}

enum Outcome {
    Extracted(Extracted),
    /// Listed by extension, but no extractor accepts the content.
    Unclaimed(SourceFile),
}

impl Outcome {
    fn path(&self) -> &str {
        match self {
            Outcome::Extracted(extracted) => extracted.file.path.as_str(),
            Outcome::Unclaimed(file) => file.path.as_str(),
        }
    }
}

/// Orchestrates full, incremental and path-scoped indexing runs.
pub struct Coordinator {
    store: IndexStore,
    tree: Arc<dyn SourceTree>,
    registry: Arc<ExtractorRegistry>,
    config: IndexingConfig,
    run_lock: Mutex<()>,
    state: RwLock<RunState>,
    progress: Option<ProgressHook>,
}

impl Coordinator {
    pub fn new(
        store: IndexStore,
        tree: Arc<dyn SourceTree>,
        registry: Arc<ExtractorRegistry>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            store,
            tree,
            registry,
            config,
            run_lock: Mutex::new(()),
            state: RwLock::new(RunState::Idle),
            progress: None,
        }
    }

    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    fn workers(&self) -> usize {
        if self.config.parallel {
            self.config.max_workers.max(1)
        } else {
            1
        }
    }

    /// Re-extract every eligible file and drop files that disappeared.
    pub async fn full(&self) -> Result<RunStats> {
        let _run = self.run_lock.lock().await;
        let _idle = StateGuard::new(&self.state);
        let started = Instant::now();
        let mut stats = RunStats::new(RunMode::Full);

        self.set_state(RunState::Scanning);
        let listing = self.scan(&mut stats)?;
        let previous = self
            .store
            .file_records()
            .map_err(|e| AtlasError::store("*", "file_records", e))?;

        let changes = ChangeSet {
            deleted: deleted_paths(&previous, &listing),
            added: listing,
            ..ChangeSet::default()
        };
        self.execute(&changes, &mut stats).await?;

        self.store
            .set_last_full_index(now())
            .map_err(|e| AtlasError::store("*", "set_last_full_index", e))?;
        Ok(self.finish(stats, started))
    }

    /// Process only what changed since the stored state. Falls back to a full
    /// run when the index has never completed one (fresh or rebuilt schema).
    pub async fn incremental(&self) -> Result<RunStats> {
        let never_indexed = self
            .store
            .last_full_index()
            .map_err(|e| AtlasError::store("*", "last_full_index", e))?
            .is_none();
        if never_indexed {
            info!("No completed full index, running a full pass");
            return self.full().await;
        }

        let _run = self.run_lock.lock().await;
        let _idle = StateGuard::new(&self.state);
        let started = Instant::now();
        let mut stats = RunStats::new(RunMode::Incremental);

        self.set_state(RunState::Scanning);
        let listing = self.scan(&mut stats)?;
        let previous = self
            .store
            .file_records()
            .map_err(|e| AtlasError::store("*", "file_records", e))?;
        let changes = diff(&previous, &listing, self.tree.as_ref());

        self.execute(&changes, &mut stats).await?;
        Ok(self.finish(stats, started))
    }

    /// Re-check a specific set of root-relative paths, as delivered by the
    /// watch queue. Missing or no-longer-eligible paths are deleted. A path
    /// naming a directory stands for every stored or eligible file beneath it.
    pub async fn run_paths(&self, paths: &[String]) -> Result<RunStats> {
        let _run = self.run_lock.lock().await;
        let _idle = StateGuard::new(&self.state);
        let started = Instant::now();
        let mut stats = RunStats::new(RunMode::Paths);

        self.set_state(RunState::Scanning);
        let paths = self.expand_directories(paths)?;
        let mut previous = HashMap::new();
        let mut current = Vec::new();
        let mut deleted = Vec::new();

        for path in &paths {
            let stored = self
                .store
                .get_file(path)
                .map_err(|e| AtlasError::store(path.as_str(), "get_file", e))?;

            match self.tree.stat(path) {
                Some(file) if file.size > self.config.max_file_bytes => {
                    stats.skipped_oversize += 1;
                    if stored.is_some() {
                        deleted.push(path.clone());
                    }
                }
                Some(file) => {
                    if let Some(record) = stored {
                        previous.insert(path.clone(), record);
                    }
                    current.push(file);
                }
                None => {
                    if stored.is_some() {
                        deleted.push(path.clone());
                    }
                }
            }
        }
        stats.scanned = current.len();

        let mut changes = diff(&previous, &current, self.tree.as_ref());
        changes.deleted = deleted;
        changes.deleted.sort();
        changes.deleted.dedup();

        self.execute(&changes, &mut stats).await?;
        Ok(self.finish(stats, started))
    }

    /// Replace directory paths with the files under them. Paths that are
    /// neither an eligible file nor a stored record are treated as
    /// directories; unknown paths pass through unchanged.
    fn expand_directories(&self, paths: &[String]) -> Result<Vec<String>> {
        let mut expanded = BTreeSet::new();
        let mut stored: Option<HashMap<String, FileRecord>> = None;

        for path in paths {
            let path = path.trim_end_matches('/');
            if path.is_empty() {
                continue;
            }
            if self.tree.stat(path).is_some() {
                expanded.insert(path.to_string());
                continue;
            }
            if stored.is_none() {
                stored = Some(
                    self.store
                        .file_records()
                        .map_err(|e| AtlasError::store(path, "file_records", e))?,
                );
            }
            let records = stored.iter().flat_map(|r| r.keys());
            if stored.as_ref().is_some_and(|r| r.contains_key(path)) {
                expanded.insert(path.to_string());
                continue;
            }

            let prefix = format!("{}/", path);
            let before = expanded.len();
            expanded.extend(records.filter(|p| p.starts_with(&prefix)).cloned());
            expanded.extend(self.tree.list_under(path)?.into_iter().map(|f| f.path));
            if expanded.len() == before {
                expanded.insert(path.to_string());
            } else {
                debug!("Expanded directory {} to {} paths", path, expanded.len() - before);
            }
        }
        Ok(expanded.into_iter().collect())
    }

    /// Compact the store. Waits for any active run to finish first.
    pub async fn optimize(&self) -> Result<()> {
        let _run = self.run_lock.lock().await;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.compact())
            .await
            .map_err(|e| AtlasError::Io(std::io::Error::other(e)))?
            .map_err(|e| AtlasError::store("*", "compact", e))
    }

    fn set_state(&self, state: RunState) {
        debug!("Coordinator state -> {:?}", state);
        *self.state.write() = state;
    }

    /// List eligible files, setting aside those over the size limit.
    fn scan(&self, stats: &mut RunStats) -> Result<Vec<SourceFile>> {
        let limit = self.config.max_file_bytes;
        let (listing, oversize): (Vec<_>, Vec<_>) = self
            .tree
            .list()?
            .into_iter()
            .partition(|f| f.size <= limit);

        for file in &oversize {
            debug!("Skipping {} ({} bytes > {})", file.path, file.size, limit);
        }
        stats.skipped_oversize = oversize.len();
        stats.scanned = listing.len();
        Ok(listing)
    }

    async fn execute(&self, changes: &ChangeSet, stats: &mut RunStats) -> Result<()> {
        stats.unchanged = changes.unchanged;

        for file in &changes.touched {
            self.store
                .touch_file(&file.path, file.size, file.mtime)
                .map_err(|e| AtlasError::store(file.path.as_str(), "touch_file", e))?;
        }

        for path in &changes.deleted {
            let removed = self
                .store
                .delete_file(path)
                .map_err(|e| AtlasError::store(path.as_str(), "delete_file", e))?;
            if removed {
                debug!("Removed {}", path);
                stats.deleted += 1;
            }
        }

        let work = changes.to_index();
        if work.is_empty() {
            return Ok(());
        }

        self.set_state(RunState::Dispatching);
        let mut results = self.dispatch(work).await;
        // Apply order is fixed so logs and generations are reproducible
        results.sort_by(|a, b| result_path(a).cmp(result_path(b)));

        self.set_state(RunState::Applying);
        for result in results {
            match result {
                Ok(Outcome::Extracted(extracted)) => self.apply(extracted, stats)?,
                Ok(Outcome::Unclaimed(file)) => self.drop_unclaimed(&file.path, stats)?,
                Err(e) if e.is_per_file() => {
                    warn!("{}", e);
                    stats.failed += 1;
                    stats.failures.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn drop_unclaimed(&self, path: &str, stats: &mut RunStats) -> Result<()> {
        debug!("No extractor claims {}, skipping", path);
        stats.skipped_unclaimed += 1;
        let removed = self
            .store
            .delete_file(path)
            .map_err(|e| AtlasError::store(path, "delete_file", e))?;
        if removed {
            debug!("Removed {} (no longer claimed)", path);
            stats.deleted += 1;
        }
        Ok(())
    }

    /// Fan extraction out over a bounded pool of blocking tasks.
    async fn dispatch(&self, work: Vec<SourceFile>) -> Vec<Result<Outcome>> {
        let total = work.len();
        let workers = self.workers();
        let timeout = Duration::from_millis(self.config.parse_timeout_ms);
        info!("Extracting {} files with {} workers", total, workers);

        let jobs = work.into_iter().map(|file| {
            let tree = Arc::clone(&self.tree);
            let registry = Arc::clone(&self.registry);
            async move {
                let path = file.path.clone();
                let handle =
                    tokio::task::spawn_blocking(move || extract_file(tree.as_ref(), &registry, file));
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(AtlasError::Extraction {
                        path,
                        message: format!("extractor panicked: {}", join),
                    }),
                    Err(_) => Err(AtlasError::Timeout {
                        path,
                        millis: timeout.as_millis() as u64,
                    }),
                }
            }
        });

        let mut done = 0usize;
        let mut results = Vec::with_capacity(total);
        let mut stream = stream::iter(jobs).buffer_unordered(workers);
        while let Some(result) = stream.next().await {
            done += 1;
            if let Some(hook) = &self.progress {
                hook(done, total);
            }
            results.push(result);
        }
        results
    }

    fn apply(&self, extracted: Extracted, stats: &mut RunStats) -> Result<()> {
        let path = extracted.file.path.as_str();
        let normalized = normalize(path, extracted.language, &extracted.extraction);

        if let Some(reason) = &extracted.extraction.partial {
            warn!("Partial extraction of {}: {}", path, reason);
            stats.partial += 1;
        }

        let record = FileRecord {
            path: path.to_string(),
            content_hash: extracted.hash,
            language: extracted.language.to_string(),
            size: extracted.file.size,
            mtime: extracted.file.mtime,
            line_count: extracted.line_count,
            last_indexed_at: now(),
            symbol_ids: normalized.symbols.iter().map(|s| s.id.clone()).collect(),
        };

        self.store
            .upsert_file(&record, &normalized.symbols, &normalized.relationships)
            .map_err(|e| AtlasError::store(path, "upsert_file", e))?;

        debug!(
            "Indexed {}: {} symbols, {} relationships",
            path,
            normalized.symbols.len(),
            normalized.relationships.len()
        );
        stats.indexed += 1;
        stats.symbols += normalized.symbols.len();
        stats.relationships += normalized.relationships.len();
        stats.dropped_references += normalized.dropped_references;
        Ok(())
    }

    fn finish(&self, mut stats: RunStats, started: Instant) -> RunStats {
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "{:?} run: {} indexed, {} unchanged, {} deleted, {} failed, {} partial in {}ms",
            stats.mode,
            stats.indexed,
            stats.unchanged,
            stats.deleted,
            stats.failed,
            stats.partial,
            stats.elapsed_ms
        );
        stats
    }
}

/// Resets the coordinator to Idle however the run ends.
struct StateGuard<'a> {
    state: &'a RwLock<RunState>,
}

impl<'a> StateGuard<'a> {
    fn new(state: &'a RwLock<RunState>) -> Self {
        Self { state }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state.write() = RunState::Idle;
    }
}

fn deleted_paths(previous: &HashMap<String, FileRecord>, listing: &[SourceFile]) -> Vec<String> {
    let present: std::collections::HashSet<&str> =
        listing.iter().map(|f| f.path.as_str()).collect();
    let mut deleted: Vec<String> = previous
        .keys()
        .filter(|p| !present.contains(p.as_str()))
        .cloned()
        .collect();
    deleted.sort();
    deleted
}

fn result_path(result: &Result<Outcome>) -> &str {
    match result {
        Ok(outcome) => outcome.path(),
        Err(AtlasError::Extraction { path, .. })
        | Err(AtlasError::Read { path, .. })
        | Err(AtlasError::Timeout { path, .. })
        | Err(AtlasError::Store { path, .. }) => path.as_str(),
        Err(_) => "",
    }
}

/// Read, select an extractor and extract one file. Runs on a blocking thread.
fn extract_file(
    tree: &dyn SourceTree,
    registry: &ExtractorRegistry,
    file: SourceFile,
) -> Result<Outcome> {
    let bytes = tree.read(&file.path)?;
    let hash = content_hash(&bytes);
    let content = String::from_utf8_lossy(&bytes);

    let Some(extractor) = registry.select(&file.path, &content) else {
        return Ok(Outcome::Unclaimed(file));
    };

    let extraction = extractor.extract(&file.path, &content)?;
    let line_count = content.lines().count() as u32;

    Ok(Outcome::Extracted(Extracted {
        language: extractor.language(),
        hash,
        line_count,
        extraction,
        file,
    }))
}

#[cfg(test)]
mod tests {
    use super::changes::tests::MemoryTree;
    use super::parser::Extractor;
    use super::*;
    use crate::index::SymbolKind;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const AUTH: &str = "import hashlib\nimport jwt\n\ndef authenticate(user, password):\n    return hashlib.sha256(password)\n";
    const VIEWS: &str = "from auth import authenticate\n\ndef login(request):\n    return authenticate(request.user, request.password)\n";

    /// Fails on any file whose content contains `BROKEN`.
    struct Flaky;

    impl Extractor for Flaky {
        fn language(&self) -> &'static str {
            "python"
        }

        fn extensions(&self) -> &'static [&'static str] {
            &["py"]
        }

        fn extract(&self, path: &str, content: &str) -> Result<Extraction> {
            if content.contains("BROKEN") {
                return Err(AtlasError::Extraction {
                    path: path.to_string(),
                    message: "boom".to_string(),
                });
            }
            parser::PythonExtractor.extract(path, content)
        }
    }

    fn setup(workers: usize) -> (TempDir, Arc<MemoryTree>, Coordinator) {
        setup_with(workers, ExtractorRegistry::with_defaults())
    }

    fn setup_with(
        workers: usize,
        registry: ExtractorRegistry,
    ) -> (TempDir, Arc<MemoryTree>, Coordinator) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();
        let tree = Arc::new(MemoryTree::new());
        let config = IndexingConfig {
            max_workers: workers,
            ..IndexingConfig::default()
        };
        let coordinator = Coordinator::new(
            store,
            tree.clone() as Arc<dyn SourceTree>,
            Arc::new(registry),
            config,
        );
        (dir, tree, coordinator)
    }

    fn flaky_registry() -> ExtractorRegistry {
        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(Flaky));
        registry
    }

    #[tokio::test]
    async fn test_full_run_indexes_every_file() {
        let (_dir, tree, coordinator) = setup(4);
        tree.put("auth.py", AUTH, 1);
        tree.put("views.py", VIEWS, 1);

        let stats = coordinator.full().await.unwrap();
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(coordinator.state(), RunState::Idle);

        let symbols = coordinator.store().symbols_in_file("auth.py").unwrap();
        assert!(symbols.iter().any(|s| s.name == "authenticate" && s.kind == SymbolKind::Function));
        assert!(coordinator.store().last_full_index().unwrap().is_some());

        let record = coordinator.store().get_file("auth.py").unwrap().unwrap();
        let ids: Vec<_> = symbols.iter().map(|s| s.id.clone()).collect();
        assert_eq!(record.symbol_ids, ids);
        assert_eq!(record.language, "python");
    }

    #[tokio::test]
    async fn test_incremental_only_touches_changes() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("auth.py", AUTH, 1);
        tree.put("views.py", VIEWS, 1);
        coordinator.full().await.unwrap();

        let stats = coordinator.incremental().await.unwrap();
        assert_eq!(stats.mode, RunMode::Incremental);
        assert_eq!(stats.indexed, 0);
        assert_eq!(stats.unchanged, 2);

        tree.put("views.py", "def logout(request):\n    pass\n", 2);
        tree.remove("auth.py");
        tree.put("models.py", "class User:\n    pass\n", 2);

        let stats = coordinator.incremental().await.unwrap();
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.deleted, 1);

        let store = coordinator.store();
        assert!(store.symbols_in_file("auth.py").unwrap().is_empty());
        let views = store.symbols_in_file("views.py").unwrap();
        assert!(views.iter().all(|s| s.name != "login"));
        assert!(views.iter().any(|s| s.name == "logout"));
    }

    #[tokio::test]
    async fn test_touch_without_edit_skips_extraction() {
        let (_dir, tree, coordinator) = setup(1);
        tree.put("auth.py", AUTH, 1);
        coordinator.full().await.unwrap();
        let generation = coordinator.store().generation().unwrap();

        tree.put("auth.py", AUTH, 50);
        let stats = coordinator.incremental().await.unwrap();
        assert_eq!(stats.indexed, 0);
        assert_eq!(coordinator.store().generation().unwrap(), generation);
        assert_eq!(coordinator.store().get_file("auth.py").unwrap().unwrap().mtime, 50);
    }

    #[tokio::test]
    async fn test_failed_file_keeps_previous_entry() {
        let (_dir, tree, coordinator) = setup_with(3, flaky_registry());
        tree.put("a.py", "def a():\n    pass\n", 1);
        tree.put("b.py", "def b():\n    pass\n", 1);
        tree.put("f.py", "def f():\n    pass\n", 1);
        tree.put("c.py", "def c():\n    pass\n", 1);
        coordinator.full().await.unwrap();

        tree.put("a.py", "def a2():\n    pass\n", 2);
        tree.put("f.py", "BROKEN = 1\ndef f2():\n    pass\n", 2);
        tree.put("new.py", "BROKEN = 2\n", 2);
        let stats = coordinator.incremental().await.unwrap();

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.warnings(), 2);
        assert!(stats.failures.iter().any(|f| f.contains("f.py")));

        let store = coordinator.store();
        let f: Vec<_> = store.symbols_in_file("f.py").unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(f, vec!["f".to_string()]);
        assert!(store.get_file("new.py").unwrap().is_none());
        assert_eq!(store.symbols_in_file("a.py").unwrap()[0].name, "a2");
        assert_eq!(store.symbols_in_file("c.py").unwrap()[0].name, "c");
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_result() {
        let files = [
            ("auth.py", AUTH),
            ("views.py", VIEWS),
            ("models.py", "class User:\n    def save(self):\n        pass\n"),
            ("util.py", "MAX = 3\n\ndef clamp(x):\n    return min(x, MAX)\n"),
        ];

        let mut snapshots = Vec::new();
        for workers in [1, 4] {
            let (_dir, tree, coordinator) = setup(workers);
            for (path, content) in files {
                tree.put(path, content, 1);
            }
            coordinator.full().await.unwrap();

            let mut all = Vec::new();
            for (path, _) in files {
                for symbol in coordinator.store().symbols_in_file(path).unwrap() {
                    all.push((symbol.id.clone(), symbol.tiers.full.clone()));
                }
            }
            snapshots.push(all);
        }
        assert_eq!(snapshots[0], snapshots[1]);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("auth.py", AUTH, 1);
        coordinator.full().await.unwrap();
        let first = coordinator.store().symbols_in_file("auth.py").unwrap();

        coordinator.full().await.unwrap();
        let second = coordinator.store().symbols_in_file("auth.py").unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_oversize_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("index.db")).unwrap();
        let tree = Arc::new(MemoryTree::new());
        tree.put("big.py", &"x = 1\n".repeat(100), 1);
        tree.put("small.py", "y = 2\n", 1);
        let config = IndexingConfig {
            max_file_bytes: 64,
            ..IndexingConfig::default()
        };
        let coordinator = Coordinator::new(
            store,
            tree.clone() as Arc<dyn SourceTree>,
            Arc::new(ExtractorRegistry::with_defaults()),
            config,
        );

        let stats = coordinator.full().await.unwrap();
        assert_eq!(stats.skipped_oversize, 1);
        assert_eq!(stats.indexed, 1);
        assert!(coordinator.store().get_file("big.py").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_paths_handles_edits_and_deletes() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("auth.py", AUTH, 1);
        tree.put("views.py", VIEWS, 1);
        coordinator.full().await.unwrap();

        tree.put("auth.py", "def verify(token):\n    pass\n", 2);
        tree.remove("views.py");
        let stats = coordinator
            .run_paths(&["auth.py".to_string(), "views.py".to_string(), "nope.py".to_string()])
            .await
            .unwrap();

        assert_eq!(stats.mode, RunMode::Paths);
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.deleted, 1);
        assert!(coordinator.store().get_file("views.py").unwrap().is_none());
        assert_eq!(coordinator.store().symbols_in_file("auth.py").unwrap()[0].name, "verify");
    }

    #[tokio::test]
    async fn test_plain_html_is_skipped_not_failed() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("auth.py", AUTH, 1);
        tree.put("static/index.html", "<html>\n<body><p>Hello</p></body>\n</html>\n", 1);

        let stats = coordinator.full().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.warnings(), 0);
        assert_eq!(stats.skipped_unclaimed, 1);
        assert_eq!(stats.indexed, 1);
        assert!(coordinator.store().get_file("static/index.html").unwrap().is_none());

        let stats = coordinator.incremental().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.skipped_unclaimed, 1);
        assert!(stats.failures.is_empty());
        assert!(coordinator.store().get_file("static/index.html").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_template_losing_its_syntax_is_removed() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put(
            "templates/page.html",
            "{% extends \"base.html\" %}\n{% block content %}\n<p>Hi</p>\n{% endblock %}\n",
            1,
        );
        coordinator.full().await.unwrap();
        let record = coordinator.store().get_file("templates/page.html").unwrap().unwrap();
        assert_eq!(record.language, "template");
        assert!(!record.symbol_ids.is_empty());

        tree.put("templates/page.html", "<html>\n<p>Hi</p>\n</html>\n", 2);
        let stats = coordinator.incremental().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.skipped_unclaimed, 1);
        assert_eq!(stats.deleted, 1);

        let store = coordinator.store();
        assert!(store.get_file("templates/page.html").unwrap().is_none());
        assert!(store.symbols_in_file("templates/page.html").unwrap().is_empty());
        assert!(store.find_by_name("content", 10, 0).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_aborts_run_without_partial_record() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("a.py", "def a():\n    pass\n", 1);
        tree.put("b.py", "def doomed():\n    pass\n\ndef other():\n    pass\n", 1);
        tree.put("c.py", "def c():\n    pass\n", 1);

        // Simulates the disk failing halfway through b.py's transaction
        coordinator
            .store()
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_doomed BEFORE INSERT ON symbols
                 WHEN NEW.name = 'doomed'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let err = coordinator.full().await.unwrap_err();
        assert!(!err.is_per_file());
        match &err {
            AtlasError::Store { path, operation, .. } => {
                assert_eq!(path, "b.py");
                assert_eq!(*operation, "upsert_file");
            }
            other => panic!("expected a store error, got {}", other),
        }
        assert_eq!(coordinator.state(), RunState::Idle);

        let store = coordinator.store();
        assert!(store.get_file("a.py").unwrap().is_some());
        assert!(store.get_file("b.py").unwrap().is_none());
        assert!(store.symbols_in_file("b.py").unwrap().is_empty());
        assert!(store.get_file("c.py").unwrap().is_none());
        assert!(store.last_full_index().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_paths_expands_directories() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("pkg/a.py", "def a():\n    pass\n", 1);
        tree.put("pkg/sub/b.py", "def b():\n    pass\n", 1);
        tree.put("other.py", "def other():\n    pass\n", 1);
        coordinator.full().await.unwrap();

        // pkg/ renamed to lib/
        tree.remove("pkg/a.py");
        tree.remove("pkg/sub/b.py");
        tree.put("lib/a.py", "def a():\n    pass\n", 2);
        tree.put("lib/sub/b.py", "def b():\n    pass\n", 2);

        let stats = coordinator
            .run_paths(&["pkg".to_string(), "lib/".to_string()])
            .await
            .unwrap();
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.failed, 0);

        let store = coordinator.store();
        assert!(store.get_file("pkg/a.py").unwrap().is_none());
        assert!(store.get_file("pkg/sub/b.py").unwrap().is_none());
        assert!(store.get_file("lib/sub/b.py").unwrap().is_some());
        assert!(store.get_file("other.py").unwrap().is_some());

        // Removing the directory outright
        tree.remove("lib/a.py");
        tree.remove("lib/sub/b.py");
        let stats = coordinator.run_paths(&["lib".to_string()]).await.unwrap();
        assert_eq!(stats.deleted, 2);
        assert_eq!(store.stats().unwrap().files, 1);
    }

    #[tokio::test]
    async fn test_progress_hook_sees_every_file() {
        let (_dir, tree, coordinator) = setup(2);
        tree.put("auth.py", AUTH, 1);
        tree.put("views.py", VIEWS, 1);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let coordinator = coordinator.with_progress(Arc::new(move |done, total| {
            sink.lock().push((done, total));
        }));
        coordinator.full().await.unwrap();

        assert_eq!(*seen.lock(), vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_optimize_keeps_data() {
        let (_dir, tree, coordinator) = setup(1);
        tree.put("auth.py", AUTH, 1);
        coordinator.full().await.unwrap();
        coordinator.optimize().await.unwrap();
        assert_eq!(coordinator.store().stats().unwrap().files, 1);
    }
}

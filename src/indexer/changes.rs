// Source tree enumeration and change detection

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::parser::ExtractorRegistry;
use crate::config::IgnoreMatcher;
use crate::error::{AtlasError, Result};
use crate::index::{content_hash, FileRecord};

/// An eligible file as seen on disk. `path` is relative to the tree root
/// and always uses `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
}

/// Where files come from. The local filesystem in production, an in-memory
/// tree in tests.
pub trait SourceTree: Send + Sync {
    fn root(&self) -> &Path;

    /// Every eligible file, sorted by path.
    fn list(&self) -> Result<Vec<SourceFile>>;

    /// Metadata for one relative path, or None if it no longer exists or is
    /// not eligible.
    fn stat(&self, relative: &str) -> Option<SourceFile>;

    fn read(&self, relative: &str) -> Result<Vec<u8>>;

    /// Eligible files beneath a relative directory, sorted by path. Empty
    /// when `dir` is not a directory.
    fn list_under(&self, dir: &str) -> Result<Vec<SourceFile>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .list()?
            .into_iter()
            .filter(|f| f.path.starts_with(&prefix))
            .collect())
    }
}

/// Filesystem-backed tree filtered by ignore patterns and extractor support.
pub struct LocalSourceTree {
    root: PathBuf,
    ignore: IgnoreMatcher,
    registry: Arc<ExtractorRegistry>,
    include_hidden: bool,
}

impl LocalSourceTree {
    pub fn new(
        root: impl Into<PathBuf>,
        ignore: IgnoreMatcher,
        registry: Arc<ExtractorRegistry>,
        include_hidden: bool,
    ) -> Self {
        Self {
            root: root.into(),
            ignore,
            registry,
            include_hidden,
        }
    }

    /// Root-relative path with forward slashes, or None for paths outside the root.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Whether a root-relative path would be listed.
    pub fn accepts(&self, relative: &str) -> bool {
        if self.ignore.is_ignored(relative) || !self.registry.is_candidate(relative) {
            return false;
        }
        self.include_hidden || !relative.split('/').any(is_hidden_name)
    }

    /// Whether a root-relative directory could hold listed files.
    pub fn accepts_dir(&self, relative: &str) -> bool {
        if self.ignore.is_ignored(relative) {
            return false;
        }
        self.include_hidden || !relative.split('/').any(is_hidden_name)
    }

    fn walk(&self, start: &Path) -> Vec<SourceFile> {
        let mut files = Vec::new();

        let walker = WalkDir::new(start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| self.keep_entry(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = self.relative(entry.path()) else {
                continue;
            };
            if !self.accepts(&relative) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => files.push(SourceFile {
                    path: relative,
                    size: meta.len(),
                    mtime: mtime_secs(&meta),
                }),
                Err(e) => warn!("Cannot stat {}: {}", relative, e),
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    fn keep_entry(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if !self.include_hidden && is_hidden_name(&name) {
            return false;
        }
        match self.relative(entry.path()) {
            Some(rel) => !self.ignore.is_ignored(&rel),
            None => false,
        }
    }
}

impl SourceTree for LocalSourceTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self) -> Result<Vec<SourceFile>> {
        let files = self.walk(&self.root);
        debug!("Enumerated {} eligible files under {}", files.len(), self.root.display());
        Ok(files)
    }

    fn list_under(&self, dir: &str) -> Result<Vec<SourceFile>> {
        let dir = dir.trim_end_matches('/');
        let start = self.root.join(dir);
        if dir.is_empty() || !self.accepts_dir(dir) || !start.is_dir() {
            return Ok(Vec::new());
        }
        Ok(self.walk(&start))
    }

    fn stat(&self, relative: &str) -> Option<SourceFile> {
        if !self.accepts(relative) {
            return None;
        }
        let meta = std::fs::metadata(self.root.join(relative)).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(SourceFile {
            path: relative.to_string(),
            size: meta.len(),
            mtime: mtime_secs(&meta),
        })
    }

    fn read(&self, relative: &str) -> Result<Vec<u8>> {
        std::fs::read(self.root.join(relative)).map_err(|source| AtlasError::Read {
            path: relative.to_string(),
            source,
        })
    }
}

fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Partition of the current listing against the stored file records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<SourceFile>,
    pub modified: Vec<SourceFile>,
    pub deleted: Vec<String>,
    /// Files whose metadata changed but whose content hash did not.
    pub touched: Vec<SourceFile>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Files that need extraction, in path order.
    pub fn to_index(&self) -> Vec<SourceFile> {
        let mut files: Vec<SourceFile> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

/// Compare stored records with the current listing.
///
/// Equal size and mtime count as unchanged without reading the file. When
/// either differs the content hash decides; an unreadable file is reported
/// as modified so extraction surfaces the read error.
pub fn diff(
    previous: &HashMap<String, FileRecord>,
    current: &[SourceFile],
    tree: &dyn SourceTree,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for file in current {
        seen.insert(file.path.as_str());
        let Some(record) = previous.get(&file.path) else {
            changes.added.push(file.clone());
            continue;
        };

        if record.size == file.size && record.mtime == file.mtime {
            changes.unchanged += 1;
            continue;
        }

        match tree.read(&file.path) {
            Ok(bytes) if content_hash(&bytes) == record.content_hash => {
                debug!("{} touched without content change", file.path);
                changes.touched.push(file.clone());
                changes.unchanged += 1;
            }
            Ok(_) => changes.modified.push(file.clone()),
            Err(e) => {
                debug!("Hash check failed for {}: {}", file.path, e);
                changes.modified.push(file.clone());
            }
        }
    }

    let mut deleted: Vec<String> = previous
        .keys()
        .filter(|path| !seen.contains(path.as_str()))
        .cloned()
        .collect();
    deleted.sort();
    changes.deleted = deleted;

    changes
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    /// In-memory tree for coordinator and detector tests.
    pub(crate) struct MemoryTree {
        root: PathBuf,
        pub files: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    }

    impl MemoryTree {
        pub(crate) fn new() -> Self {
            Self {
                root: PathBuf::from("/memory"),
                files: Mutex::new(BTreeMap::new()),
            }
        }

        pub(crate) fn put(&self, path: &str, content: &str, mtime: i64) {
            self.files
                .lock()
                .insert(path.to_string(), (content.as_bytes().to_vec(), mtime));
        }

        pub(crate) fn remove(&self, path: &str) {
            self.files.lock().remove(path);
        }
    }

    impl SourceTree for MemoryTree {
        fn root(&self) -> &Path {
            &self.root
        }

        fn list(&self) -> Result<Vec<SourceFile>> {
            Ok(self
                .files
                .lock()
                .iter()
                .map(|(path, (bytes, mtime))| SourceFile {
                    path: path.clone(),
                    size: bytes.len() as u64,
                    mtime: *mtime,
                })
                .collect())
        }

        fn stat(&self, relative: &str) -> Option<SourceFile> {
            self.files.lock().get(relative).map(|(bytes, mtime)| SourceFile {
                path: relative.to_string(),
                size: bytes.len() as u64,
                mtime: *mtime,
            })
        }

        fn read(&self, relative: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .get(relative)
                .map(|(bytes, _)| bytes.clone())
                .ok_or_else(|| AtlasError::Read {
                    path: relative.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                })
        }
    }

    fn record(path: &str, content: &str, mtime: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            content_hash: content_hash(content.as_bytes()),
            language: "python".to_string(),
            size: content.len() as u64,
            mtime,
            line_count: 1,
            last_indexed_at: 0,
            symbol_ids: Vec::new(),
        }
    }

    #[test]
    fn test_diff_partitions_files() {
        let tree = MemoryTree::new();
        tree.put("a.py", "x = 1\n", 10);
        tree.put("b.py", "y = 2\n", 20);
        tree.put("c.py", "z = 3\n", 30);

        let mut previous = HashMap::new();
        previous.insert("a.py".to_string(), record("a.py", "x = 1\n", 10));
        previous.insert("b.py".to_string(), record("b.py", "y = 1\n", 15));
        previous.insert("gone.py".to_string(), record("gone.py", "", 1));

        let listing = tree.list().unwrap();
        let changes = diff(&previous, &listing, &tree);

        assert_eq!(changes.added.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["c.py"]);
        assert_eq!(changes.modified.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["b.py"]);
        assert_eq!(changes.deleted, vec!["gone.py".to_string()]);
        assert_eq!(changes.unchanged, 1);
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_touch_without_edit_is_not_modified() {
        let tree = MemoryTree::new();
        tree.put("a.py", "x = 1\n", 99);

        let mut previous = HashMap::new();
        previous.insert("a.py".to_string(), record("a.py", "x = 1\n", 10));

        let changes = diff(&previous, &tree.list().unwrap(), &tree);
        assert!(changes.is_empty());
        assert_eq!(changes.touched.len(), 1);
        assert_eq!(changes.unchanged, 1);
    }

    #[test]
    fn test_local_tree_respects_ignores_and_hidden() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::create_dir_all(root.join(".hidden")).unwrap();
        std::fs::create_dir_all(root.join("generated")).unwrap();
        std::fs::write(root.join("src/app.py"), "def main():\n    pass\n").unwrap();
        std::fs::write(root.join("src/notes.txt"), "not code").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::write(root.join(".hidden/secret.py"), "x = 1").unwrap();
        std::fs::write(root.join("generated/api.py"), "x = 1").unwrap();

        let ignore = IgnoreMatcher::new(&["generated".to_string()]).unwrap();
        let tree = LocalSourceTree::new(
            root,
            ignore,
            Arc::new(ExtractorRegistry::with_defaults()),
            false,
        );

        let files = tree.list().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/app.py"]);
        assert!(tree.stat("src/app.py").is_some());
        assert!(tree.stat("generated/api.py").is_none());
        assert!(tree.stat("src/missing.py").is_none());
        assert!(matches!(tree.read("src/missing.py"), Err(AtlasError::Read { .. })));
    }

    #[test]
    fn test_list_under_walks_one_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("pkg/sub")).unwrap();
        std::fs::create_dir_all(root.join("generated")).unwrap();
        std::fs::write(root.join("pkg/a.py"), "x = 1\n").unwrap();
        std::fs::write(root.join("pkg/sub/b.py"), "y = 2\n").unwrap();
        std::fs::write(root.join("pkg/readme.txt"), "docs").unwrap();
        std::fs::write(root.join("top.py"), "z = 3\n").unwrap();
        std::fs::write(root.join("generated/api.py"), "x = 1\n").unwrap();

        let ignore = IgnoreMatcher::new(&["generated".to_string()]).unwrap();
        let tree = LocalSourceTree::new(
            root,
            ignore,
            Arc::new(ExtractorRegistry::with_defaults()),
            false,
        );

        let paths: Vec<String> = tree.list_under("pkg/").unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["pkg/a.py".to_string(), "pkg/sub/b.py".to_string()]);
        assert!(tree.list_under("generated").unwrap().is_empty());
        assert!(tree.list_under("top.py").unwrap().is_empty());
        assert!(tree.list_under("gone").unwrap().is_empty());
        assert!(tree.accepts_dir("pkg"));
        assert!(!tree.accepts_dir(".git"));
    }
}

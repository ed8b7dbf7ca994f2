// CLI command implementations

pub mod index;
pub mod query;
pub mod stats;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};

use codeatlas::config::{Config, ProjectPaths};
use codeatlas::index::db::IndexStore;
use codeatlas::index::schema::SchemaStatus;
use codeatlas::indexer::changes::LocalSourceTree;
use codeatlas::indexer::parser::ExtractorRegistry;
use codeatlas::indexer::{Coordinator, ProgressHook};
use codeatlas::query::QueryEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Everything a command needs about one project.
pub struct Workspace {
    pub paths: ProjectPaths,
    pub config: Config,
    pub store: IndexStore,
}

impl Workspace {
    pub fn open(project: &str, config: Config) -> Result<Self> {
        let root = Path::new(project)
            .canonicalize()
            .with_context(|| format!("Project directory not found: {}", project))?;
        let paths = ProjectPaths::new(root);

        std::fs::create_dir_all(&paths.data_dir)
            .with_context(|| format!("Failed to create {}", paths.data_dir.display()))?;
        let store = IndexStore::open(&paths.db_path)
            .with_context(|| format!("Failed to open index at {}", paths.db_path.display()))?;

        if let SchemaStatus::Rebuilt { from_version } = store.schema_status() {
            eprintln!(
                "Index schema v{} was outdated and has been reset; the next update re-indexes everything.",
                from_version
            );
        }

        Ok(Self {
            paths,
            config,
            store,
        })
    }

    pub fn source_tree(&self, registry: Arc<ExtractorRegistry>) -> Result<Arc<LocalSourceTree>> {
        let ignore = self.config.ignore_matcher()?;
        Ok(Arc::new(LocalSourceTree::new(
            self.paths.root.clone(),
            ignore,
            registry,
            self.config.indexing.include_hidden,
        )))
    }

    /// Coordinator over the local tree, plus the tree itself for watching.
    pub fn coordinator(
        &self,
        progress: Option<ProgressHook>,
    ) -> Result<(Arc<Coordinator>, Arc<LocalSourceTree>)> {
        let registry = Arc::new(ExtractorRegistry::with_defaults());
        let tree = self.source_tree(registry.clone())?;
        let mut coordinator = Coordinator::new(
            self.store.clone(),
            tree.clone(),
            registry,
            self.config.indexing.clone(),
        );
        if let Some(hook) = progress {
            coordinator = coordinator.with_progress(hook);
        }
        Ok((Arc::new(coordinator), tree))
    }

    pub fn engine(&self) -> QueryEngine {
        QueryEngine::new(
            self.store.clone(),
            self.config.query.clone(),
            self.config.indexing.cache_enabled,
        )
    }
}

pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Progress hook that reports file counts on a spinner.
pub fn spinner_hook(pb: &ProgressBar) -> ProgressHook {
    let pb = pb.clone();
    Arc::new(move |done, total| {
        pb.set_message(format!("Indexing {}/{} files", done, total));
    })
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

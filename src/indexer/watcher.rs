// Watch/debounce queue feeding batched path runs to the coordinator

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use notify::event::{CreateKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::changes::{LocalSourceTree, SourceTree};
use super::{Coordinator, RunStats};
use crate::config::WatchConfig;
use crate::error::{AtlasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// One raw change notification for a root-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    pub at: SystemTime,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            at: SystemTime::now(),
        }
    }
}

/// Receiver of flushed batches. Implemented by the coordinator; tests plug
/// in recorders.
pub trait BatchSink: Send + Sync + 'static {
    fn apply(&self, batch: Vec<ChangeEvent>) -> BoxFuture<'_, Result<RunStats>>;
}

impl BatchSink for Coordinator {
    fn apply(&self, batch: Vec<ChangeEvent>) -> BoxFuture<'_, Result<RunStats>> {
        Box::pin(async move {
            let paths: Vec<String> = batch.into_iter().map(|e| e.path).collect();
            self.run_paths(&paths).await
        })
    }
}

/// Result of one flushed batch, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct WatchUpdate {
    pub paths: Vec<String>,
    pub stats: Option<RunStats>,
    pub error: Option<String>,
}

/// Pending set with last-event-wins per path and a quiet-period deadline.
#[derive(Debug)]
pub struct DebounceState {
    pending: HashMap<String, ChangeEvent>,
    debounce: Duration,
    max_pending: usize,
    deadline: Option<Instant>,
    forced: bool,
}

impl DebounceState {
    pub fn new(debounce: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            debounce,
            max_pending: max_pending.max(1),
            deadline: None,
            forced: false,
        }
    }

    /// Record an event and restart the quiet period.
    pub fn record(&mut self, event: ChangeEvent, now: Instant) {
        self.pending.insert(event.path.clone(), event);
        self.deadline = Some(now + self.debounce);
        if self.pending.len() >= self.max_pending {
            self.forced = true;
        }
    }

    /// Request a flush of whatever is pending. A no-op on an empty set.
    pub fn force(&mut self) {
        self.forced = !self.pending.is_empty();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether a flush is due right now, without waiting for the deadline.
    pub fn flush_now(&self) -> bool {
        self.forced && !self.pending.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            self.deadline
        }
    }

    /// Drain the pending set, ordered by path.
    pub fn take(&mut self) -> Vec<ChangeEvent> {
        self.deadline = None;
        self.forced = false;
        let mut batch: Vec<ChangeEvent> = self.pending.drain().map(|(_, e)| e).collect();
        batch.sort_by(|a, b| a.path.cmp(&b.path));
        batch
    }
}

enum WatchCommand {
    Flush,
    Shutdown,
}

/// Handle to a running debounce loop.
///
/// Events go in through [`WatchQueue::event_sender`]; each flush becomes one
/// coordinator run. Flushes that arrive while a run is active are merged
/// into the next run.
pub struct WatchQueue {
    event_tx: mpsc::Sender<ChangeEvent>,
    command_tx: mpsc::Sender<WatchCommand>,
    update_tx: broadcast::Sender<WatchUpdate>,
    _watcher: Option<RecommendedWatcher>,
}

impl WatchQueue {
    /// Start the debounce loop and the batch runner.
    pub fn start(sink: Arc<dyn BatchSink>, config: &WatchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (update_tx, _) = broadcast::channel(32);

        let state = DebounceState::new(Duration::from_millis(config.debounce_ms), config.max_pending);
        tokio::spawn(debounce_loop(state, event_rx, command_rx, batch_tx));
        tokio::spawn(run_batches(sink, batch_rx, update_tx.clone()));

        Self {
            event_tx,
            command_tx,
            update_tx,
            _watcher: None,
        }
    }

    /// Start the queue and attach a filesystem watcher on the tree's root.
    pub fn watch(
        sink: Arc<dyn BatchSink>,
        config: &WatchConfig,
        tree: Arc<LocalSourceTree>,
    ) -> Result<Self> {
        let mut queue = Self::start(sink, config);
        queue._watcher = Some(create_fs_watcher(tree, queue.event_tx.clone())?);
        Ok(queue)
    }

    pub fn event_sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.event_tx.clone()
    }

    pub async fn notify(&self, event: ChangeEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| AtlasError::Io(std::io::Error::other("watch queue closed")))
    }

    /// Flush whatever is pending without waiting for the quiet period.
    pub async fn flush(&self) -> Result<()> {
        self.command_tx
            .send(WatchCommand::Flush)
            .await
            .map_err(|_| AtlasError::Io(std::io::Error::other("watch queue closed")))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchUpdate> {
        self.update_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(WatchCommand::Shutdown).await;
    }
}

impl Drop for WatchQueue {
    fn drop(&mut self) {
        let _ = self.command_tx.try_send(WatchCommand::Shutdown);
    }
}

async fn debounce_loop(
    mut state: DebounceState,
    mut event_rx: mpsc::Receiver<ChangeEvent>,
    mut command_rx: mpsc::Receiver<WatchCommand>,
    batch_tx: mpsc::UnboundedSender<Vec<ChangeEvent>>,
) {
    loop {
        if state.flush_now() {
            if !hand_off(&mut state, &batch_tx) {
                break;
            }
            continue;
        }

        let next_deadline = state.next_deadline();
        tokio::select! {
            // Events first, so a flush sees everything sent before it
            biased;
            event = event_rx.recv() => match event {
                Some(event) => {
                    debug!("Change {:?} {}", event.kind, event.path);
                    state.record(event, Instant::now());
                }
                None => break,
            },
            Some(cmd) = command_rx.recv() => match cmd {
                WatchCommand::Flush => state.force(),
                WatchCommand::Shutdown => break,
            },
            () = async {
                if let Some(deadline) = next_deadline {
                    time::sleep_until(deadline).await;
                }
            }, if next_deadline.is_some() => {
                if !hand_off(&mut state, &batch_tx) {
                    break;
                }
            }
        }
    }
    debug!("Debounce loop stopped with {} pending", state.pending());
}

fn hand_off(state: &mut DebounceState, batch_tx: &mpsc::UnboundedSender<Vec<ChangeEvent>>) -> bool {
    let batch = state.take();
    if batch.is_empty() {
        return true;
    }
    debug!("Flushing {} changed paths", batch.len());
    batch_tx.send(batch).is_ok()
}

/// Run one sink call per flush, merging flushes that queued up meanwhile.
async fn run_batches(
    sink: Arc<dyn BatchSink>,
    mut batch_rx: mpsc::UnboundedReceiver<Vec<ChangeEvent>>,
    update_tx: broadcast::Sender<WatchUpdate>,
) {
    while let Some(first) = batch_rx.recv().await {
        let mut merged: BTreeMap<String, ChangeEvent> = BTreeMap::new();
        for event in first {
            merged.insert(event.path.clone(), event);
        }
        while let Ok(more) = batch_rx.try_recv() {
            for event in more {
                merged.insert(event.path.clone(), event);
            }
        }

        let batch: Vec<ChangeEvent> = merged.into_values().collect();
        let paths: Vec<String> = batch.iter().map(|e| e.path.clone()).collect();

        let update = match sink.apply(batch).await {
            Ok(stats) => {
                info!(
                    "Re-indexed {} changed paths: {} indexed, {} deleted, {} failed",
                    paths.len(),
                    stats.indexed,
                    stats.deleted,
                    stats.failed
                );
                WatchUpdate {
                    paths,
                    stats: Some(stats),
                    error: None,
                }
            }
            Err(e) => {
                error!("Watch batch failed: {}", e);
                WatchUpdate {
                    paths,
                    stats: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let _ = update_tx.send(update);
    }
}

fn create_fs_watcher(
    tree: Arc<LocalSourceTree>,
    sender: mpsc::Sender<ChangeEvent>,
) -> Result<RecommendedWatcher> {
    let root = tree.root().to_path_buf();
    let filter = Arc::clone(&tree);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate(&filter, &event) {
                    // Runs on the notify thread, never inside the runtime
                    let _ = sender.blocking_send(change);
                }
            }
            Err(e) => warn!("File watch error: {}", e),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| AtlasError::Io(std::io::Error::other(format!("watcher init failed: {}", e))))?;

    watcher.watch(&root, RecursiveMode::Recursive).map_err(|e| {
        AtlasError::Io(std::io::Error::other(format!(
            "failed to watch {}: {}",
            root.display(),
            e
        )))
    })?;
    info!("Watching {}", root.display());
    Ok(watcher)
}

/// Map a notify event to root-relative changes. Directory creates, removes
/// and renames pass through as-is; the coordinator expands them into the
/// files beneath.
fn translate(tree: &LocalSourceTree, event: &Event) -> Vec<ChangeEvent> {
    let (kind, may_be_dir) = match event.kind {
        EventKind::Create(CreateKind::Folder) => (ChangeKind::Created, true),
        EventKind::Create(_) => (ChangeKind::Created, false),
        EventKind::Modify(ModifyKind::Name(_)) => (ChangeKind::Modified, true),
        EventKind::Modify(_) => (ChangeKind::Modified, false),
        EventKind::Remove(_) => (ChangeKind::Removed, true),
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter_map(|p| tree.relative(p))
        .filter(|rel| tree.accepts(rel) || (may_be_dir && tree.accepts_dir(rel)))
        .map(|rel| ChangeEvent::new(rel, kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::RunMode;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Recorder {
        batches: Mutex<Vec<Vec<(String, ChangeKind)>>>,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    impl BatchSink for Recorder {
        fn apply(&self, batch: Vec<ChangeEvent>) -> BoxFuture<'_, Result<RunStats>> {
            Box::pin(async move {
                self.batches
                    .lock()
                    .push(batch.into_iter().map(|e| (e.path, e.kind)).collect());
                time::sleep(self.delay).await;
                Ok(RunStats::new(RunMode::Paths))
            })
        }
    }

    fn config(debounce_ms: u64, max_pending: usize) -> WatchConfig {
        WatchConfig {
            enabled: true,
            debounce_ms,
            max_pending,
        }
    }

    async fn next_update(rx: &mut broadcast::Receiver<WatchUpdate>) -> WatchUpdate {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("update in time")
            .expect("channel open")
    }

    #[test]
    fn test_last_event_wins_per_path() {
        let mut state = DebounceState::new(Duration::from_millis(100), 10);
        let now = Instant::now();
        state.record(ChangeEvent::new("a.py", ChangeKind::Created), now);
        state.record(ChangeEvent::new("b.py", ChangeKind::Modified), now);
        state.record(ChangeEvent::new("a.py", ChangeKind::Removed), now);

        assert_eq!(state.pending(), 2);
        assert!(!state.flush_now());
        let batch = state.take();
        let kinds: Vec<_> = batch.iter().map(|e| (e.path.as_str(), e.kind)).collect();
        assert_eq!(kinds, vec![("a.py", ChangeKind::Removed), ("b.py", ChangeKind::Modified)]);
        assert!(state.next_deadline().is_none());
    }

    #[test]
    fn test_threshold_forces_flush() {
        let mut state = DebounceState::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        state.record(ChangeEvent::new("a.py", ChangeKind::Modified), now);
        assert!(!state.flush_now());
        state.record(ChangeEvent::new("b.py", ChangeKind::Modified), now);
        assert!(state.flush_now());
    }

    #[test]
    fn test_deadline_moves_with_each_event() {
        let mut state = DebounceState::new(Duration::from_millis(100), 10);
        let start = Instant::now();
        state.record(ChangeEvent::new("a.py", ChangeKind::Modified), start);
        let later = start + Duration::from_millis(50);
        state.record(ChangeEvent::new("a.py", ChangeKind::Modified), later);
        assert_eq!(state.next_deadline(), Some(later + Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_rapid_edits_coalesce_into_one_run() {
        let recorder = Recorder::new(Duration::ZERO);
        let queue = WatchQueue::start(recorder.clone(), &config(50, 100));
        let mut updates = queue.subscribe();

        for _ in 0..10 {
            queue.notify(ChangeEvent::new("src/app.py", ChangeKind::Modified)).await.unwrap();
        }

        let update = next_update(&mut updates).await;
        assert_eq!(update.paths, vec!["src/app.py".to_string()]);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_flush_skips_quiet_period() {
        let recorder = Recorder::new(Duration::ZERO);
        let queue = WatchQueue::start(recorder.clone(), &config(60_000, 100));
        let mut updates = queue.subscribe();

        queue.notify(ChangeEvent::new("a.py", ChangeKind::Created)).await.unwrap();
        queue.notify(ChangeEvent::new("b.py", ChangeKind::Modified)).await.unwrap();
        queue.flush().await.unwrap();

        let update = next_update(&mut updates).await;
        assert_eq!(update.paths, vec!["a.py".to_string(), "b.py".to_string()]);
    }

    #[tokio::test]
    async fn test_size_threshold_flushes() {
        let recorder = Recorder::new(Duration::ZERO);
        let queue = WatchQueue::start(recorder.clone(), &config(60_000, 3));
        let mut updates = queue.subscribe();

        for path in ["a.py", "b.py", "c.py"] {
            queue.notify(ChangeEvent::new(path, ChangeKind::Modified)).await.unwrap();
        }
        let update = next_update(&mut updates).await;
        assert_eq!(update.paths.len(), 3);
    }

    #[tokio::test]
    async fn test_flushes_during_a_run_are_merged() {
        let recorder = Recorder::new(Duration::from_millis(300));
        let queue = WatchQueue::start(recorder.clone(), &config(60_000, 100));
        let mut updates = queue.subscribe();

        queue.notify(ChangeEvent::new("a.py", ChangeKind::Modified)).await.unwrap();
        queue.flush().await.unwrap();
        time::sleep(Duration::from_millis(100)).await;

        // First run is still sleeping; these two flushes must share one run
        queue.notify(ChangeEvent::new("b.py", ChangeKind::Modified)).await.unwrap();
        queue.flush().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
        queue.notify(ChangeEvent::new("c.py", ChangeKind::Modified)).await.unwrap();
        queue.flush().await.unwrap();

        let first = next_update(&mut updates).await;
        let second = next_update(&mut updates).await;
        assert_eq!(first.paths, vec!["a.py".to_string()]);
        assert_eq!(second.paths, vec!["b.py".to_string(), "c.py".to_string()]);
        assert_eq!(recorder.batches.lock().len(), 2);
    }

    #[test]
    fn test_directory_events_reach_the_queue() {
        use crate::config::IgnoreMatcher;
        use crate::indexer::parser::ExtractorRegistry;
        use notify::event::{DataChange, RemoveKind, RenameMode};

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let tree = LocalSourceTree::new(
            root.clone(),
            IgnoreMatcher::new(&["generated".to_string()]).unwrap(),
            Arc::new(ExtractorRegistry::with_defaults()),
            false,
        );
        let changes = |event: Event| -> Vec<(String, ChangeKind)> {
            translate(&tree, &event)
                .into_iter()
                .map(|e| (e.path, e.kind))
                .collect()
        };

        let removed = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root.join("pkg"));
        assert_eq!(changes(removed), vec![("pkg".to_string(), ChangeKind::Removed)]);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("pkg"))
            .add_path(root.join("lib"));
        assert_eq!(
            changes(renamed),
            vec![
                ("pkg".to_string(), ChangeKind::Modified),
                ("lib".to_string(), ChangeKind::Modified),
            ]
        );

        let created = Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.join("generated"));
        assert!(changes(created).is_empty());

        // Content edits still need an eligible file
        let edited = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(root.join("notes.txt"))
            .add_path(root.join("app.py"));
        assert_eq!(changes(edited), vec![("app.py".to_string(), ChangeKind::Modified)]);
    }
}

// Query session telemetry and the lifetime rollup

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::engine::QueryResponse;
use crate::error::{AtlasError, Result};

/// Most recent entries kept in the per-session log.
const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub at: DateTime<Utc>,
    pub intent: String,
    pub query: String,
    pub tokens_used: usize,
    pub tokens_saved: usize,
    pub latency_ms: u64,
    pub cached: bool,
}

/// Counters for one session. Passed explicitly to whoever answers queries
/// and flushed at session boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySession {
    pub started_at: DateTime<Utc>,
    pub queries: u64,
    pub tokens_used: u64,
    pub baseline_tokens: u64,
    pub tokens_saved: u64,
    pub cache_hits: u64,
    pub total_latency_ms: u64,
    #[serde(default)]
    pub log: Vec<QueryLogEntry>,
}

impl Default for QuerySession {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            queries: 0,
            tokens_used: 0,
            baseline_tokens: 0,
            tokens_saved: 0,
            cache_hits: 0,
            total_latency_ms: 0,
            log: Vec::new(),
        }
    }
}

impl QuerySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, response: &QueryResponse, latency_ms: u64) {
        let saved = response.tokens_saved();
        self.queries += 1;
        self.tokens_used += response.tokens_used as u64;
        self.baseline_tokens += response.baseline_tokens as u64;
        self.tokens_saved += saved as u64;
        self.total_latency_ms += latency_ms;
        if response.cached {
            self.cache_hits += 1;
        }

        if self.log.len() >= LOG_CAPACITY {
            self.log.remove(0);
        }
        self.log.push(QueryLogEntry {
            at: Utc::now(),
            intent: response.intent.clone(),
            query: response.query.clone(),
            tokens_used: response.tokens_used,
            tokens_saved: saved,
            latency_ms,
            cached: response.cached,
        });
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.queries as f64
        }
    }

    /// Percentage of baseline tokens avoided.
    pub fn savings_percent(&self) -> f64 {
        if self.baseline_tokens == 0 {
            0.0
        } else {
            self.tokens_saved as f64 * 100.0 / self.baseline_tokens as f64
        }
    }

    /// Load a saved session, starting fresh when the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        load_json(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }

    /// Fold this session into the lifetime rollup at `lifetime_path` and reset.
    pub fn end_session(&mut self, lifetime_path: &Path) -> Result<LifetimeStats> {
        let mut lifetime: LifetimeStats = load_json(lifetime_path).unwrap_or_default();
        lifetime.absorb(self);
        save_json(lifetime_path, &lifetime)?;
        debug!(
            "Session folded into lifetime stats ({} queries)",
            self.queries
        );
        *self = QuerySession::new();
        Ok(lifetime)
    }
}

/// Totals across every ended session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifetimeStats {
    pub sessions: u64,
    pub queries: u64,
    pub tokens_used: u64,
    pub baseline_tokens: u64,
    pub tokens_saved: u64,
    pub cache_hits: u64,
    pub total_latency_ms: u64,
    pub first_session: Option<DateTime<Utc>>,
    pub last_session: Option<DateTime<Utc>>,
}

impl LifetimeStats {
    pub fn load(path: &Path) -> Self {
        load_json(path).unwrap_or_default()
    }

    fn absorb(&mut self, session: &QuerySession) {
        self.sessions += 1;
        self.queries += session.queries;
        self.tokens_used += session.tokens_used;
        self.baseline_tokens += session.baseline_tokens;
        self.tokens_saved += session.tokens_saved;
        self.cache_hits += session.cache_hits;
        self.total_latency_ms += session.total_latency_ms;
        self.first_session = Some(
            self.first_session
                .map_or(session.started_at, |t| t.min(session.started_at)),
        );
        self.last_session = Some(Utc::now());
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let file = File::open(path).ok()?;
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring corrupted {}: {}", path.display(), e);
            None
        }
    }
}

/// Write through a temporary sibling so readers never see a partial file.
fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AtlasError::Io(std::io::Error::other(e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::intent::Intent;
    use pretty_assertions::assert_eq;

    fn response(tokens_used: usize, baseline: usize, cached: bool) -> QueryResponse {
        let intent = Intent::Find {
            name: "x".to_string(),
        };
        let mut response = QueryResponse::new("find x", &intent, 10_000);
        response.tokens_used = tokens_used;
        response.baseline_tokens = baseline;
        response.cached = cached;
        response
    }

    #[test]
    fn test_record_accumulates() {
        let mut session = QuerySession::new();
        session.record(&response(100, 1000, false), 4);
        session.record(&response(50, 500, true), 2);

        assert_eq!(session.queries, 2);
        assert_eq!(session.tokens_used, 150);
        assert_eq!(session.tokens_saved, 1350);
        assert_eq!(session.cache_hits, 1);
        assert_eq!(session.log.len(), 2);
        assert_eq!(session.average_latency_ms(), 3.0);
        assert_eq!(session.savings_percent(), 90.0);
    }

    #[test]
    fn test_saved_never_negative() {
        let mut session = QuerySession::new();
        session.record(&response(300, 100, false), 1);
        assert_eq!(session.tokens_saved, 0);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut session = QuerySession::new();
        for _ in 0..LOG_CAPACITY + 10 {
            session.record(&response(1, 2, false), 0);
        }
        assert_eq!(session.log.len(), LOG_CAPACITY);
        assert_eq!(session.queries, (LOG_CAPACITY + 10) as u64);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut session = QuerySession::new();
        session.record(&response(10, 40, false), 1);
        session.save(&path).unwrap();

        assert_eq!(QuerySession::load(&path), session);
    }

    #[test]
    fn test_corrupted_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(QuerySession::load(&path).queries, 0);
    }

    #[test]
    fn test_end_session_folds_into_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let lifetime_path = dir.path().join("nested").join("lifetime.json");

        let mut session = QuerySession::new();
        session.record(&response(10, 40, false), 1);
        let lifetime = session.end_session(&lifetime_path).unwrap();
        assert_eq!(lifetime.sessions, 1);
        assert_eq!(lifetime.tokens_saved, 30);
        assert_eq!(session.queries, 0);

        session.record(&response(5, 25, true), 1);
        let lifetime = session.end_session(&lifetime_path).unwrap();
        assert_eq!(lifetime.sessions, 2);
        assert_eq!(lifetime.queries, 2);
        assert_eq!(lifetime.tokens_saved, 50);
        assert_eq!(lifetime.cache_hits, 1);
        assert_eq!(LifetimeStats::load(&lifetime_path), lifetime);
    }
}

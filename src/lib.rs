//! Structural code index with token-budgeted queries.
//!
//! Source files are parsed into symbols and relationships, stored in SQLite,
//! kept current by incremental or watch-driven updates, and answered through
//! a query engine that never returns more than a caller's token budget.

pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod query;

pub use config::{Config, ProjectPaths};
pub use error::{AtlasError, Result, StoreError};
pub use index::db::IndexStore;
pub use index::{Relationship, Symbol, Tier};
pub use indexer::{Coordinator, RunStats};
pub use query::{QueryEngine, QueryResponse, QuerySession};

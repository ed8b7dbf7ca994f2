// Query planning, budgeted execution and session telemetry

pub mod engine;
pub mod intent;
pub mod session;

pub use engine::{QueryEngine, QueryResponse, ResultItem};
pub use intent::{plan, Intent};
pub use session::{LifetimeStats, QuerySession};

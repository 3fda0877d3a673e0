//! Gridpoint resolution service.
//!
//! Ties the partition, the version store and the remote authority together:
//! - `resolver`: calls `/points/{lat},{lon}` with retry and backoff
//! - `throttle`: adaptive concurrency and pacing for outbound calls
//! - `orchestrator`: refresh runs over every active cell
//! - `lookup`: coordinate to current gridpoint, table first, over an index
//!   that follows the latest partition
//! - `server`: HTTP API over lookups, history and run status

pub mod config;
pub mod lookup;
pub mod metrics;
pub mod orchestrator;
pub mod resolver;
pub mod server;
pub mod throttle;

pub use config::ServiceConfig;
pub use lookup::{
    Fallback, IndexLoadError, IndexReloader, LookupError, LookupOutcome, LookupService,
};
pub use orchestrator::{
    OrchestratorError, RefreshOrchestrator, RefreshSettings, RunReport,
};
pub use resolver::{
    CallError, HttpPointsApi, PointResolution, PointsApi, ResolutionClient, ResolveError,
    RetryPolicy,
};
pub use server::{create_router, run_server, ServerState};
pub use throttle::{Throttle, ThrottleConfig};

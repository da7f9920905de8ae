//! TaskTrack Export - asynchronous, resumable task exports
//!
//! Turns "export these tasks as CSV/JSON" into a background job with:
//! - A persistent priority queue with a concurrency ceiling and crash recovery
//! - Streaming execution with checkpoints, pause/resume and cancellation
//! - A two-tier result cache with selective invalidation on task changes
//! - A real-time gateway that pushes job events to connected clients
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    TaskTrack Export Architecture                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  HTTP / gateway clients                                          │
//! │     │                                ▲ events                    │
//! │     ▼                                │                           │
//! │  ┌──────────────┐   transitions   ┌──────────────────┐           │
//! │  │ExportService │ ──────────────► │ JobStateManager  │           │
//! │  └──────┬───────┘                 └────────┬─────────┘           │
//! │         │ add_job                          │ guarded writes      │
//! │         ▼                                  ▼                     │
//! │  ┌──────────────┐  claim_next   ┌──────────────────────────┐     │
//! │  │   JobQueue   │ ◄───────────► │ DurableStore (Redis/mem) │     │
//! │  └──────┬───────┘               │  pending set, job hashes │     │
//! │         │ process               │  ephemeral cache entries │     │
//! │         ▼                       └──────────────────────────┘     │
//! │  ┌──────────────┐   lookup/store  ┌───────────────────────┐      │
//! │  │ExportExecutor│ ──────────────► │  ExportCacheService   │      │
//! │  └──────┬───────┘                 │  + export_history (db)│      │
//! │         │ fetch_batch             └───────────────────────┘      │
//! │         ▼                                                        │
//! │  ┌──────────────┐   encode   ┌──────────────────┐                │
//! │  │  TaskSource  │ ─────────► │  artifact files  │                │
//! │  └──────────────┘            └──────────────────┘                │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tasktrack_export::prelude::*;
//!
//! let service = ExportService::in_memory(source, ExportConfig::default());
//! service.initialize().await?;
//!
//! let job = service
//!     .submit(ExportRequest {
//!         format: "csv".into(),
//!         priority: Some(5),
//!         ..Default::default()
//!     })
//!     .await?;
//! ```

pub mod artifact;
pub mod cache;
pub mod db;
pub mod encoder;
pub mod error;
pub mod events;
pub mod executor;
pub mod filter;
pub mod gateway;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod source;
pub mod state;
pub mod store;

pub use artifact::ArtifactStore;
pub use cache::{CacheKey, CachedExport, ExportCacheService, ExportHistoryStore, InvalidationReport, TtlClass};
pub use encoder::RecordEncoder;
pub use error::{ExportError, ExportResult};
pub use events::{ExportEvent, GatewayCommand, JobSnapshot};
pub use executor::ExportExecutor;
pub use filter::{SortDirection, SortField, SortSpec, TaskFilter};
pub use gateway::{ConnectionId, ConnectionRegistry, ExportGateway, ReconnectReport};
pub use job::{ExportArtifact, ExportFormat, ExportPayload, Job, JobId, JobOptions, JobStatus};
pub use metrics::{register_metrics, CacheMetrics, GatewayMetrics, QueueMetrics};
pub use queue::{CleanupReport, JobProcessor, JobQueue, ProcessOutcome, QueueStats, RecoveryReport};
pub use service::{ExportDownload, ExportRequest, ExportService, ExportServiceInterface};
pub use source::{MemoryTaskSource, SqliteTaskSource, TaskSource};
pub use state::JobStateManager;
pub use store::{DurableStore, MemoryStore, RedisStore, StoreKeys};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::job::{ExportFormat, JobId, JobStatus};
    pub use crate::service::{ExportRequest, ExportService, ExportServiceInterface};
    pub use crate::source::TaskSource;
    pub use crate::{ExportError, ExportResult, TaskFilter};
    pub use tasktrack_config::ExportConfig;
}

//! Foreman - Background Job Orchestration
//!
//! Durable background jobs over Postgres: idempotent creation, atomic
//! claiming, heartbeat-based liveness, cooperative cancellation, explicit
//! retries and named locks.
//!
//! ```text
//! callers ──> JobManager ──> JobStore (Postgres / in-memory)
//!                 ▲
//! Worker ──> JobRunner ──> JobHandler (via JobContext)
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod job;
pub mod manager;
pub mod registry;
pub mod runner;
pub mod store;
pub mod worker;

pub use config::Config;
pub use context::JobContext;
pub use events::{JobEvent, JobEventKind};
pub use job::{
    idempotency_key, ErrorKind, Job, JobError, JobParams, JobPriority, JobStatus, JobType,
};
pub use manager::{CancelOutcome, CreateJob, JobManager, RetryOutcome};
pub use registry::{HandlerRegistry, JobHandler};
pub use runner::{classify, Fault, JobRunner};
pub use store::{JobFilter, JobStore, MemoryJobStore, PostgresJobStore, StoreError};
pub use worker::{Worker, WorkerConfig};

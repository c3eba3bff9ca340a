//! regsync Core Library
//!
//! Planning, bounded fan-out and result persistence for bulk registry jobs.
//! A job lists its work units, and [`run_job`] drives each one through the
//! job's pipeline with at most `concurrency` in flight, writing one
//! [`ResultRow`] per unit to CSV and JSON as it completes.

pub mod error;
pub mod jobs;
pub mod metrics;
pub mod obs;
pub mod planner;
pub mod pool;
pub mod progress;
pub mod run;
pub mod sink;
pub mod telemetry;

pub use error::{PipelineError, PlanError, PreconditionError, Result, SinkError, SyncError};

pub use jobs::update::{all_project_ids, DEFAULT_PROTECTED_DOMAIN};
pub use jobs::{
    AuditStatusJob, BackupJob, CreateUserRow, CreateUsersJob, Job, JobContext, UpdateJob,
};

pub use metrics::RunMetrics;

pub use planner::{
    plan, Change, ChangeSpec, Disposition, ExclusionRule, MutationPlan, RewriteField,
};

pub use pool::{PoolConfig, PoolReport, WorkUnit};

pub use progress::{ProgressMode, ProgressReporter};

pub use run::{
    run_job, RunOptions, RunOutcome, EXIT_CANCELLED, EXIT_FAILURES, EXIT_OK, EXIT_PRECONDITION,
};

pub use sink::{MemorySink, ResultRow, ResultSink, RowSink, RowStatus, RunCounts, RunSummary};

pub use telemetry::init_tracing;

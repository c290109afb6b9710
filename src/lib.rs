//! shardtest: a declarative distributed-test orchestrator.
//!
//! One job spec names repositories, tokens, preparation and finalization
//! steps, a main testing step and a sharding strategy. The engine explodes
//! the main step into independently executable subtasks, packs them onto
//! pod-equivalents up to per-pod concurrency and capacity caps, runs them
//! in parallel with retries, stages artifacts and emits a JSON report.
//!
//! The execution substrate is polymorphic: a Kubernetes cluster, the
//! local filesystem, or a dry run.

pub mod backend;
pub mod config;
pub mod events;
pub mod fsutil;
pub mod logging;
pub mod report;
pub mod resources;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod task;

pub use backend::{Backend, BackendError, CancelToken, Executor, PodHandle, RunMode};
pub use config::{ConfigError, SpecLoader, TestJob};
pub use events::{Event, EventBus, EventHandler};
pub use logging::{LogLevel, Logger, MaskedMessage};
pub use report::{Report, ReportDetail, ResultStatus, SubTaskStatus};
pub use resources::{ResourceError, ResourceManager, SecretReader};
pub use retry::RetryPolicy;
pub use runner::{Runner, RunnerError};
pub use scheduler::{SubTaskScheduler, TaskScheduler};
pub use task::{SubTask, SubTaskResult, Task, TaskBuilder, TaskGroup, TaskGroupResult};

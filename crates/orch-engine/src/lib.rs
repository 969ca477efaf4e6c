//! orch-engine — asynchronous invocation engine.
//!
//! Runs deployment operations against blueprint revisions with a
//! submit/poll contract: callers get a `PENDING` invocation back at once
//! and read the outcome from the invocation log later.
//!
//! # Components
//!
//! - **`service`** — `InvocationService`: validation, submission, queries, deletion, recovery
//! - **`worker`** — the queue and the workers that execute invocations
//! - **`engine`** — adapter to the external TOSCA engine

pub mod engine;
pub mod error;
pub mod service;
pub mod worker;

pub use engine::{CapturedOutput, CommandEngine, EngineFailure, EngineJob, ToscaEngine};
pub use error::{EngineError, EngineResult};
pub use service::{InvocationService, InvokeRequest, RecoveryReport, launch};
pub use worker::{Executor, JobQueue, JobReceiver, job_queue, spawn_workers};

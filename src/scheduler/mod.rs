//! Background task scheduling
//!
//! Priority-queue workers pulling tasks from named queues, plus the task
//! spec/retry model they operate on. Cron-like recurring jobs live in
//! `crate::jobs`.

pub mod engine;
pub mod task;

pub use engine::{
    EngineConfig, FailureRouter, HandlerResult, TaskEngine, TaskHandle, TaskRegistry, TaskRun,
};
pub use task::{FailureMark, PendingTask, RetryPolicy, TaskQueue, TaskSpec, TaskState};

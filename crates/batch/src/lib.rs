//! Batch system adapters for cyclewm.
//!
//! A [`BatchSystem`] runs submitted commands on some external scheduler.
//! Two are built in: `local` (detached processes on this host) and `slurm`.

#![warn(missing_docs)]

mod command;
mod error;
mod local;
mod registry;
mod slurm;
mod system;

pub use command::{run_command, CommandOutput};
pub use error::BatchError;
pub use local::LocalBatch;
pub use registry::{BatchConfig, BatchRegistry, BUILTIN_SCHEDULERS};
pub use slurm::SlurmBatch;
pub use system::{BatchJobState, BatchSystem, ExitRecord};

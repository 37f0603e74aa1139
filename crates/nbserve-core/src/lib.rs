//! Kernel execution management for interactive notebooks.
//!
//! Each notebook gets one interpreter subprocess (its kernel) that
//! holds interpreter state across executions. Executions against one
//! notebook are strictly serialized; different notebooks run fully in
//! parallel. The crate aggregates streamed output into notebook-shaped
//! cell outputs and enforces timeout, interrupt, and restart semantics
//! over the kernel's lifecycle.
//!
//! Layering, bottom up:
//!
//! - [`protocol`]: length-prefixed JSON frames over the kernel's
//!   stdin/stdout.
//! - [`kernel`]: the subprocess handle plus the [`kernel::Kernel`] /
//!   [`kernel::KernelLauncher`] seams.
//! - [`outputs`]: per-execution aggregation of the message stream.
//! - [`session`]: FIFO execution queue and lifecycle state machine
//!   for one kernel.
//! - [`registry`]: notebook identity to session, with a single-start
//!   guard.
//! - [`coordinator`]: path policy + notebook persistence + registry,
//!   the public entry point.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod kernel;
pub mod notebook;
pub mod outputs;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod session;

pub use config::ExecConfig;
pub use coordinator::{CellExecution, CellOutcome, Coordinator, SkipReason};
pub use error::{Error, Result};
pub use kernel::{Kernel, KernelLauncher, KernelSpec, ProcessKernel, ProcessLauncher};
pub use notebook::{Cell, IpynbStore, Notebook, NotebookStore, Source};
pub use outputs::{CellOutput, ExecutionResult, ExecutionStatus, OutputAggregator};
pub use policy::AccessPolicy;
pub use registry::{SessionRegistry, SessionStatus};
pub use session::{Session, SessionState};

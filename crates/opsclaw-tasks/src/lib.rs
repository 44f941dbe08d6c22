//! # OpsClaw Tasks
//!
//! Everything about *what* can be scheduled.
//!
//! A task is a named, categorized unit of work (`category/name`) with
//! declared dependencies, a timeout, a retry count and an optional default
//! cron schedule. Tasks come from two places:
//!
//! ```text
//! compiled-in catalog (builtin.rs)      tasks/ directory (manifest.rs)
//!   testing/sample                        monitoring/dns_monitor.toml
//!   testing/sleep                         reporting/lifecycle.toml  ([[task]] x N)
//!   system/heartbeat                      _shared.toml              (skipped)
//!            \                                /
//!             └──── TaskDiscovery ──► TaskRegistry ──► task_registry.json
//!                        │
//!                        ├── integrity: dependencies + descriptor checks
//!                        └── reconcile: orphan cleanup, default schedules
//! ```
//!
//! Every task runs in its own OS process. Command manifests exec their
//! program directly; compiled-in tasks re-exec the `opsclaw` binary, which
//! lands in [`worker::run_from_env`].

pub mod builtin;
pub mod discovery;
pub mod integrity;
pub mod manifest;
pub mod reconcile;
pub mod registry;
pub mod task;
pub mod worker;

pub use discovery::{DiscoveryReport, LoadError, TaskDiscovery};
pub use integrity::{CredentialFileResolver, DependencyResolver, IntegrityReport};
pub use manifest::TaskManifest;
pub use registry::{TaskDescriptor, TaskMetadata, TaskRegistry};
pub use task::{CommandSpec, Task, TaskContext, TaskEntry, TaskKind};

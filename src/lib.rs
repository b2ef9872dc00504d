//! `fanout` runtime library.
//!
//! This crate runs a batch of independent work items (`work`) on OS threads
//! under a resolved concurrency cap (`policy`, `config`), waits for every one of
//! them (`dispatcher`) and reduces their failures to a single verdict
//! (`outcome`). `trace` records the dispatch lifecycle and `plan` turns a YAML
//! file of external commands into work items for the `fanout` CLI.
//!
//! Invariants:
//! - never more than the effective limit of items alive at once
//! - items start in submission order as slots free up
//! - a failing item never stops its siblings; nothing is reported before all
//!   items have finished

pub mod config;
pub mod dispatcher;
pub mod launcher;
pub mod outcome;
pub mod plan;
pub mod policy;
pub mod trace;
pub mod work;

pub use config::{ConfigError, DispatchConfig};
pub use dispatcher::{run_all, DispatchReport, Dispatcher};
pub use launcher::{Launcher, ThreadLauncher};
pub use outcome::{AggregateOutcome, DispatchError};
pub use policy::ConcurrencyPolicy;
pub use work::{Failure, Location, WorkItem};

#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod build;
pub mod env;
mod error;
pub mod exec;
pub mod graph;
pub mod hash;
#[cfg(feature = "logging")]
pub mod logging;
pub mod node;
mod pool;
pub mod prefork;
pub mod report;
mod runner;
pub mod scan;
pub mod store;
pub mod task;

pub use crate::build::{BuildContext, GenContext, KeepGoing, Options};
pub use crate::env::{Environment, Value};
pub use crate::error::*;
pub use crate::exec::{Cmd, Exec, Inline, Request, Response};
pub use crate::graph::{TaskGraph, TaskId};
pub use crate::hash::{Digest, Hasher};
pub use crate::node::{GlobOptions, NodeId, NodeTree};
pub use crate::prefork::Prefork;
pub use crate::report::{Report, TaskReport};
pub use crate::scan::{IncludeScanner, Scan, ScanContext, Scanner};
pub use crate::store::SignatureStore;
pub use crate::task::{Action, HookContext, RunContext, State, Status, Task};

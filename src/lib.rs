#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cluster;
mod config;
mod core;
mod engine;
mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod store;
mod value;

pub use crate::cluster::{Accuracy, Layout, Location, Strictness, WorkType};
pub use crate::config::{CheckpointConfig, Config, HostConfig};
pub use crate::core::{DatumId, Hash32, Rank, TaskId};
pub use crate::engine::{
    Arg, Blocker, Blueprint, Body, CheckpointStore, Diagnostics, Engine, FileCheckpoints,
    FlushPolicy, Input, MemoryCheckpoints, PendingReport, PendingTask, TaskContext, TaskExecution,
    TaskSpec, TaskState, fingerprint,
};
pub use crate::error::*;
pub use crate::store::{Member, Members, Notifications, Refs, Store};
pub use crate::value::{DatumType, Key, KeyType, MergeOp, Value};

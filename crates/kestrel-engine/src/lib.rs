#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::struct_excessive_bools)]

//! Download task lifecycle core.
//!
//! Layout:
//! - `admission.rs`: FIFO wait list bounding concurrently active tasks
//! - `cache.rs`: resume records that survive restarts
//! - `engine.rs`: orchestrator, task table and reconfiguration
//! - `plan.rs`: configuration to protocol settings mapping
//! - `policy.rs`: seed-ratio auto-stop and auto-delete rules
//! - `task.rs`: per-task record and state transitions
//! - `worker.rs`: per-task event loop

pub mod admission;
pub mod cache;
mod engine;
pub mod error;
mod plan;
pub mod policy;
mod task;
mod worker;

pub use admission::{WaitEntry, WaitList};
pub use cache::{CacheRecord, ResumeCache};
pub use engine::{Engine, EngineTimings};
pub use error::{EngineError, EngineResult};
pub use policy::{PolicyAction, Standing, evaluate};
pub use task::{FileSnapshot, TaskSnapshot};

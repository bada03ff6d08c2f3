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

//! Protocol-engine seam for the Kestrel download core.
//!
//! The transfer protocol itself (peer wire, DHT, piece hashing) lives behind the
//! traits in [`service`]; this crate only defines the shapes the core exchanges
//! with it.

pub mod error;
pub mod model;
pub mod service;

pub use error::{TorrentError, TorrentResult};
pub use model::{
    CompletedTask, ObfuscationPolicy, PiecePriority, ProtocolSettings, TaskId, TaskKind,
    TaskSource, TaskSpec, TaskStats,
};
pub use service::{
    CompletionHook, DescriptorParser, ProtocolEngine, ProtocolFactory, ProtocolFile, ProtocolTask,
};

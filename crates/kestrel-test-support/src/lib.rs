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
#![allow(clippy::missing_panics_doc)]

//! Shared test helpers used across integration suites.
//! Layout: fixtures.rs (descriptor fixtures and polling helpers), scripted.rs
//! (in-memory protocol engine), hook.rs (recording completion hook).

pub mod fixtures;
pub mod hook;
pub mod scripted;

pub use fixtures::{FixtureManifest, FixtureParser, PANIC_MARKER, magnet_uri, wait_until};
pub use hook::RecordingHook;
pub use scripted::{ScriptedEngine, ScriptedFactory, ScriptedFile, ScriptedTask};

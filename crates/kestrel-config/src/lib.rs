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
#![allow(clippy::struct_excessive_bools)]

//! Engine configuration snapshot and validation.
//!
//! Loading configuration from disk or a database is the caller's concern; this
//! crate only defines the immutable snapshot applied at reconfiguration time.

pub mod error;
pub mod model;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use model::{CACHE_DIR_NAME, EngineConfig};

//! scenevault — a media-library artifact server.
//!
//! The crate is organized the way the spec's component table (§2) lays it
//! out, leaves first: [`paths`] and [`domain`] are pure data/path
//! functions; [`process`] and [`locks`] are the concurrency primitives
//! generators in [`artifacts`] build on; [`registry`], [`scheduler`], and
//! [`events`] form the job subsystem that [`dispatcher`] drives; [`engine`]
//! is the single `Engine` facade (spec §9) everything else — including the
//! [`http`] layer — is built against.

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod locks;
pub mod paths;
pub mod persistence;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod sync_ext;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};

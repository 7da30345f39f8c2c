//! C2 — Process Runner and its supporting pieces: the ffmpeg concurrency
//! gate, shared argument helpers, and `-progress pipe:1` parsing.

pub mod args;
pub mod progress;
pub mod runner;
pub mod semaphore;

pub use runner::{CommandOutput, ProcessRunner, ProgressCallback};
pub use semaphore::DynamicSemaphore;

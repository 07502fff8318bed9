//! # threadle
//!
//! Concurrency control for blocking work.
//!
//! Runs named tasks on a bounded executor with retries and backpressure
//! ([`Engine`]), throttles classes of work with permit-bounded views
//! ([`Needle`]), and serializes access to shared resources through lazily
//! created per-key locks ([`KeyedMutexes`]).

pub mod config;
pub mod engine;
pub mod error;
pub mod mutexes;
pub mod telemetry;

pub use engine::{Engine, EngineConfig, Needle, TaskHandle, Threads};
pub use error::{Error, Result};
pub use mutexes::{KeyedMutexes, MutexHandle};

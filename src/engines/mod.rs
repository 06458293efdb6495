//! # Built-in Engines
//!
//! Two [`Engine`](crate::engine::Engine) implementations ship with the
//! crate:
//!
//! - [`InProcessEngine`] drives source-to-terminal runs on the calling
//!   thread. Deterministic and dependency-free; the default.
//! - [`TokioEngine`] starts runs on the Tokio blocking pool so `run` returns
//!   before the pipeline finishes.
//!
//! Both produce identical primitives for the `build_*` operations; they
//! differ only in where a run's drive loop begins.

mod in_process;
mod tokio_engine;

pub use in_process::InProcessEngine;
pub use tokio_engine::TokioEngine;

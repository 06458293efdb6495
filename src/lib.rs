//! # fluxweave
//!
//! Demand-driven reactive stream operator pipelines in pure Rust.
//!
//! fluxweave assembles chains of transformation stages with a fluent builder
//! and materializes them into standard push-pull primitives (`Publisher`,
//! `Subscriber`, `Processor`) or an immediately started run with a
//! completion handle. The produced primitives follow the conventional
//! reactive-streams contracts end to end: signals are serialized, elements
//! never outrun requested demand, exactly one terminal signal is delivered
//! and cancellation is idempotent.
//!
//! ## Quick Start
//!
//! ```rust
//! use fluxweave::from_iterable;
//!
//! # fn main() -> Result<(), fluxweave::BuildError> {
//! let total = from_iterable(|| 1..=999_i64)
//!   .filter(|n| Ok(n % 2 == 1))
//!   .map(|n| Ok(n * 2))
//!   .collect_with(|| 0_i64, |sum, n| Ok(sum + n))
//!   .run()?;
//! assert_eq!(total.try_result().unwrap().unwrap(), 500_000);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Pieces
//!
//! - **Builders** ([`builder`], [`from_iterable`], [`from_publisher`], ...):
//!   persistent, copy-on-append stage graphs behind a typed fluent API.
//! - **Graphs** ([`Graph`]): validated stage sequences; graphs embedding a
//!   single-use external endpoint materialize exactly once.
//! - **Engines** ([`Engine`], [`InProcessEngine`], [`TokioEngine`]):
//!   pluggable translation from graphs to running pipelines.
//! - **Completion handles** ([`CompletionHandle`]): single-resolution,
//!   callback-registered and awaitable observation of a run's result.
//! - **Bridge** ([`into_stream`]): any built publisher as a `futures`
//!   stream.

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Fluent pipeline construction: builders, operators, terminals.
pub mod builder;
/// Publisher to async stream adapter.
pub mod bridge;
/// Completion handles for terminal results.
pub mod completion;
/// Factory contract for external protocol verification harnesses.
pub mod conformance;
/// The pluggable engine seam and the process-wide default engine.
pub mod engine;
/// Built-in engine implementations.
pub mod engines;
/// Structural and runtime error taxonomies.
pub mod error;
/// The stage graph data model.
pub mod graph;
/// Reactive stream primitives: Publisher, Subscriber, Subscription,
/// Processor.
pub mod spi;
/// Immutable stage descriptions and single-use endpoint cells.
pub mod stage;

mod executor;

pub use builder::{
  Collector, CompletionRunner, ProcessorBuilder, PublisherBuilder, SubscriberBuilder, builder,
  empty, failed, from_iterable, from_publisher, of,
};
pub use bridge::into_stream;
pub use completion::{CompletionHandle, RawCompletion};
pub use conformance::{ConformanceFactory, EngineConformance};
pub use engine::{Engine, default_engine, set_default_engine};
pub use engines::{InProcessEngine, TokioEngine};
pub use error::{BuildError, StreamError, StreamErrorKind, UserFnError};
pub use graph::Graph;
pub use spi::{AnyItem, Processor, Publisher, Subscriber, Subscription, any_item, take_item};

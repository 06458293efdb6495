//! In-process engine: everything happens on the threads that signal.

use std::sync::Arc;

use crate::completion::RawCompletion;
use crate::engine::Engine;
use crate::error::BuildError;
use crate::executor;
use crate::graph::Graph;
use crate::spi::{AnyItem, Processor, Publisher, Subscriber};

/// Default engine. Materialized primitives run wherever their signals
/// arrive, and `run` drives the whole pipeline on the calling thread before
/// returning when the source is synchronous.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessEngine;

impl InProcessEngine {
  /// Creates the engine. Stateless; all state lives in the pipelines it
  /// materializes.
  pub fn new() -> Self {
    Self
  }
}

impl Engine for InProcessEngine {
  fn build_publisher(&self, graph: Graph) -> Result<Arc<dyn Publisher<AnyItem>>, BuildError> {
    executor::materialize_publisher(graph)
  }

  fn build_subscriber(
    &self,
    graph: Graph,
  ) -> Result<(Arc<dyn Subscriber<AnyItem>>, Arc<RawCompletion>), BuildError> {
    executor::materialize_subscriber(graph)
  }

  fn build_processor(
    &self,
    graph: Graph,
  ) -> Result<Arc<dyn Processor<AnyItem, AnyItem>>, BuildError> {
    executor::materialize_processor(graph)
  }

  fn run(&self, graph: Graph) -> Result<Arc<RawCompletion>, BuildError> {
    executor::materialize_run(graph)
  }

  fn name(&self) -> &'static str {
    "in-process"
  }
}

//! Engine that starts runs on the Tokio blocking pool.

use std::sync::Arc;

use crate::completion::RawCompletion;
use crate::engine::Engine;
use crate::error::BuildError;
use crate::executor;
use crate::graph::Graph;
use crate::spi::{AnyItem, Processor, Publisher, Subscriber};

/// Engine backed by a Tokio runtime handle.
///
/// `build_*` products are identical to the in-process engine's; `run`
/// prepares the pipeline synchronously (so structural errors still surface
/// to the caller) and begins the drive on
/// [`spawn_blocking`](tokio::task::spawn_blocking), returning the completion
/// handle before the run finishes.
#[derive(Debug, Clone)]
pub struct TokioEngine {
  handle: tokio::runtime::Handle,
}

impl TokioEngine {
  /// Creates an engine bound to the current Tokio runtime.
  ///
  /// # Panics
  ///
  /// Panics when called outside a Tokio runtime context; use
  /// [`with_handle`](TokioEngine::with_handle) there instead.
  pub fn new() -> Self {
    Self {
      handle: tokio::runtime::Handle::current(),
    }
  }

  /// Creates an engine bound to the given runtime handle.
  pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
    Self { handle }
  }
}

impl Engine for TokioEngine {
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
    let (completion, driver) = executor::prepare_run(graph)?;
    self.handle.spawn_blocking(move || driver.start());
    Ok(completion)
  }

  fn name(&self) -> &'static str {
    "tokio"
  }
}

//! # Conformance Factory
//!
//! The capability an external protocol verifier uses to obtain fresh,
//! isolated pipeline instances. Every call materializes a new graph, so no
//! executor state is shared between the pipelines a test harness creates.

use std::sync::Arc;

use crate::builder::builder;
use crate::engine::{Engine, default_engine};
use crate::error::BuildError;
use crate::spi::Processor;

/// Factory for the primitives a protocol verification harness exercises.
pub trait ConformanceFactory: Send + Sync {
  /// Element type flowing through the produced processors.
  type Element: Send + Sync + 'static;

  /// Materializes a fresh identity processor. `buffer_size` is the largest
  /// in-flight window the harness will use; pipelines built here hold at
  /// most one undelivered element per edge, so any positive size is
  /// honored.
  ///
  /// # Errors
  ///
  /// Propagates the engine's structural errors.
  fn identity_processor(
    &self,
    buffer_size: usize,
  ) -> Result<Arc<dyn Processor<Self::Element, Self::Element>>, BuildError>;

  /// Produces the element a verifier identifies by `value`.
  fn element(&self, value: u32) -> Self::Element;
}

/// Conformance factory over an engine, producing `i32` element pipelines.
pub struct EngineConformance {
  engine: Arc<dyn Engine>,
}

impl EngineConformance {
  /// Wraps the given engine.
  pub fn new(engine: Arc<dyn Engine>) -> Self {
    Self { engine }
  }

  /// Wraps the process-wide default engine.
  pub fn with_default_engine() -> Self {
    Self {
      engine: default_engine(),
    }
  }
}

impl ConformanceFactory for EngineConformance {
  type Element = i32;

  fn identity_processor(
    &self,
    _buffer_size: usize,
  ) -> Result<Arc<dyn Processor<i32, i32>>, BuildError> {
    builder::<i32>().build_rs_with(self.engine.as_ref())
  }

  fn element(&self, value: u32) -> i32 {
    value as i32
  }
}

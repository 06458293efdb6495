//! # Engine Seam
//!
//! An [`Engine`] is a pluggable backend that translates a finished [`Graph`]
//! into concrete running primitives, independent of how the graph was built.
//! The crate ships two engines (see [`engines`](crate::engines)); anything
//! that satisfies this trait can be handed to the `*_with` materializers on
//! the builders.
//!
//! Engines operate on the type-erased layer: element transport is
//! [`AnyItem`] and completion results flow through [`RawCompletion`]. The
//! typed builder facade erases before calling in and downcasts on the way
//! out, so user code only meets the typed surface.
//!
//! A process-wide default engine backs the engine-less materializer
//! overloads. It can be installed once, during initialization, with
//! [`set_default_engine`]; when nothing is installed, the first implicit use
//! falls back to an [`InProcessEngine`](crate::engines::InProcessEngine).

use std::sync::{Arc, OnceLock};

use crate::completion::RawCompletion;
use crate::error::BuildError;
use crate::graph::Graph;
use crate::spi::{AnyItem, Processor, Publisher, Subscriber};

/// Pluggable translation from graphs to running primitives.
///
/// Engines must preserve the demand protocol end to end: everything they
/// return is expected to honor the ordering, demand and terminal-signal rules
/// documented on the [`spi`](crate::spi) traits, regardless of what threads
/// or schedulers the engine uses internally.
pub trait Engine: Send + Sync {
  /// Translates a source-led, terminal-free graph into a cold publisher.
  ///
  /// # Errors
  ///
  /// [`BuildError::EmptyGraph`] when the graph has no source,
  /// [`BuildError::GraphStructure`] when a terminal stage is present,
  /// [`BuildError::TaintedReuse`] when an embedded single-use endpoint was
  /// already claimed.
  fn build_publisher(&self, graph: Graph) -> Result<Arc<dyn Publisher<AnyItem>>, BuildError>;

  /// Translates an unsourced, terminal-ended graph into a subscriber and
  /// the completion its terminal resolves.
  ///
  /// # Errors
  ///
  /// Same conditions as [`build_publisher`](Engine::build_publisher), with
  /// the shape requirements inverted.
  fn build_subscriber(
    &self,
    graph: Graph,
  ) -> Result<(Arc<dyn Subscriber<AnyItem>>, Arc<RawCompletion>), BuildError>;

  /// Translates a transform-only graph into a processor.
  ///
  /// # Errors
  ///
  /// [`BuildError::GraphStructure`] when the graph has a source or terminal
  /// stage, [`BuildError::TaintedReuse`] on endpoint reuse.
  fn build_processor(
    &self,
    graph: Graph,
  ) -> Result<Arc<dyn Processor<AnyItem, AnyItem>>, BuildError>;

  /// Starts a source-to-terminal graph immediately, with no external
  /// subscriber involved, returning the completion of its terminal.
  ///
  /// # Errors
  ///
  /// [`BuildError::EmptyGraph`] or [`BuildError::GraphStructure`] when
  /// either end of the run shape is missing, [`BuildError::TaintedReuse`]
  /// on endpoint reuse.
  fn run(&self, graph: Graph) -> Result<Arc<RawCompletion>, BuildError>;

  /// Short engine name for diagnostics.
  fn name(&self) -> &'static str {
    "engine"
  }
}

static DEFAULT_ENGINE: OnceLock<Arc<dyn Engine>> = OnceLock::new();

/// Installs the process-wide default engine used by engine-less
/// materializer overloads.
///
/// Intended to be called once during process initialization, before the
/// first implicit use.
///
/// # Errors
///
/// [`BuildError::EngineAlreadySet`] when a default engine is already
/// installed, whether by an earlier call or by a materializer that fell back
/// to the built-in in-process engine.
pub fn set_default_engine(engine: Arc<dyn Engine>) -> Result<(), BuildError> {
  DEFAULT_ENGINE
    .set(engine)
    .map_err(|_| BuildError::EngineAlreadySet)
}

/// The process-wide default engine. Installs an
/// [`InProcessEngine`](crate::engines::InProcessEngine) on first use when
/// nothing was configured.
pub fn default_engine() -> Arc<dyn Engine> {
  Arc::clone(
    DEFAULT_ENGINE.get_or_init(|| Arc::new(crate::engines::InProcessEngine::new())),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_engine_is_installed_lazily_and_sticks() {
    let engine = default_engine();
    assert_eq!(engine.name(), "in-process");
    // Once the fallback is installed, explicit installation is refused.
    let err = set_default_engine(Arc::new(crate::engines::InProcessEngine::new())).unwrap_err();
    assert_eq!(err, BuildError::EngineAlreadySet);
  }
}

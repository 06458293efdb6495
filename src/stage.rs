//! # Pipeline Stages
//!
//! A [`Stage`] is an immutable, tagged description of one pipeline operation:
//! where elements come from, how they are transformed, or where they end up.
//! Stages carry their parameters type-erased over [`AnyItem`] and shared
//! behind [`Arc`], so a graph of stages clones cheaply and can be
//! materialized repeatedly.
//!
//! The one exception to cheap sharing is an externally supplied endpoint (a
//! caller's subscriber embedded by `to`, or a caller's processor embedded by
//! `via`). Those are single-use: their own single-subscription contract
//! cannot be satisfied twice. They live in a [`SingleUse`] cell that hands
//! ownership to the first materialization and refuses every later claim.

use std::sync::{Arc, Mutex};

use crate::error::{BuildError, StreamError, UserFnError};
use crate::graph::Graph;
use crate::spi::{AnyItem, Publisher, Subscriber};

/// Type-erased fallible map function.
pub type MapFn = Arc<dyn Fn(AnyItem) -> Result<AnyItem, UserFnError> + Send + Sync>;
/// Type-erased fallible predicate.
pub type FilterFn = Arc<dyn Fn(&AnyItem) -> Result<bool, UserFnError> + Send + Sync>;
/// Type-erased side-effecting peek function.
pub type PeekFn = Arc<dyn Fn(&AnyItem) -> Result<(), UserFnError> + Send + Sync>;
/// Type-erased function producing an inner publisher graph per element.
pub type FlatMapFn = Arc<dyn Fn(AnyItem) -> Result<Graph, UserFnError> + Send + Sync>;
/// Type-erased function producing an inner iterator per element.
pub type FlatMapIterFn =
  Arc<dyn Fn(AnyItem) -> Result<Box<dyn Iterator<Item = AnyItem> + Send>, UserFnError> + Send + Sync>;
/// Hook observing a terminal error as it crosses the hook's position.
pub type ErrorHook = Arc<dyn Fn(&StreamError) + Send + Sync>;
/// Hook observing any terminal event crossing the hook's position.
pub type TerminateHook = Arc<dyn Fn() + Send + Sync>;
/// Supplier of a fresh element iterator, invoked once per materialization.
pub type IterSupplier = Arc<dyn Fn() -> Box<dyn Iterator<Item = AnyItem> + Send> + Send + Sync>;
/// Supplier of a fresh collector accumulator.
pub type CollectSupply = Arc<dyn Fn() -> AnyItem + Send + Sync>;
/// Folds one element into a collector accumulator.
pub type CollectAccumulate = Arc<dyn Fn(AnyItem, AnyItem) -> Result<AnyItem, UserFnError> + Send + Sync>;
/// Converts the final accumulator into the collected result.
pub type CollectFinish = Arc<dyn Fn(AnyItem) -> Result<AnyItem, UserFnError> + Send + Sync>;

/// Ownership cell for a single-use endpoint embedded in a graph.
///
/// Cloning the cell shares it, so cloning a graph cannot mint a second claim
/// on the endpoint: exactly one [`take`](SingleUse::take) across all clones
/// succeeds.
pub struct SingleUse<T> {
  cell: Arc<Mutex<Option<T>>>,
}

impl<T> SingleUse<T> {
  /// Wraps `value` in a fresh single-use cell.
  pub fn new(value: T) -> Self {
    Self {
      cell: Arc::new(Mutex::new(Some(value))),
    }
  }

  /// Transfers the endpoint out of the cell. The second and every later call
  /// fails with [`BuildError::TaintedReuse`].
  pub fn take(&self) -> Result<T, BuildError> {
    let mut guard = self.cell.lock().unwrap_or_else(|e| e.into_inner());
    guard.take().ok_or(BuildError::TaintedReuse)
  }
}

impl<T> Clone for SingleUse<T> {
  fn clone(&self) -> Self {
    Self {
      cell: Arc::clone(&self.cell),
    }
  }
}

/// Both halves of an externally supplied processor, erased for embedding.
#[derive(Clone)]
pub struct ProcessorEndpoint {
  /// The processor's subscriber half; the upstream segment feeds it.
  pub subscriber: Arc<dyn Subscriber<AnyItem>>,
  /// The processor's publisher half; the downstream segment subscribes to it.
  pub publisher: Arc<dyn Publisher<AnyItem>>,
}

/// Where a pipeline's elements come from.
#[derive(Clone)]
pub enum SourceStage {
  /// Elements from a supplier-provided iterator.
  Iterable(IterSupplier),
  /// Elements from an externally authored publisher.
  SuppliedPublisher(Arc<dyn Publisher<AnyItem>>),
  /// No elements; completes immediately.
  Empty,
  /// No elements; fails immediately with the given error.
  Failed(StreamError),
}

/// An element-level transformation between source and terminal.
#[derive(Clone)]
pub enum TransformStage {
  /// One-to-one mapping.
  Map(MapFn),
  /// Keeps elements matching a predicate.
  Filter(FilterFn),
  /// Expands each element into an inner publisher graph, drained
  /// sequentially and in order.
  FlatMap(FlatMapFn),
  /// Expands each element into an iterator, drained sequentially.
  FlatMapIterable(FlatMapIterFn),
  /// Observes each element without changing it.
  Peek(PeekFn),
  /// Observes a terminal error crossing this position.
  OnError(ErrorHook),
  /// Observes completion, failure or cancellation crossing this position.
  OnTerminate(TerminateHook),
  /// Passes at most `n` elements, then completes and releases upstream.
  Take(u64),
  /// Drops the first `n` elements.
  Skip(u64),
}

/// A fan stage splices an external endpoint into the middle of a chain.
#[derive(Clone)]
pub enum FanStage {
  /// Routes the stream through an externally supplied processor.
  Via(SingleUse<ProcessorEndpoint>),
}

/// How a pipeline consumes its elements and produces a terminal result.
#[derive(Clone)]
pub enum TerminalStage {
  /// Delivers elements to an externally supplied subscriber.
  ToSubscriber(SingleUse<Arc<dyn Subscriber<AnyItem>>>),
  /// Folds every element into an accumulator, resolved on completion.
  Collect {
    /// Produces the initial accumulator.
    supply: CollectSupply,
    /// Folds one element into the accumulator.
    accumulate: CollectAccumulate,
    /// Converts the final accumulator into the result value.
    finish: CollectFinish,
  },
  /// Resolves with the first element, then cancels upstream.
  FindFirst,
  /// Discards every element, resolving on the terminal signal.
  Ignore,
  /// Cancels the stream as soon as it is wired up.
  Cancel,
}

/// One immutable pipeline operation.
#[derive(Clone)]
pub enum Stage {
  /// Element origin; only valid as the first stage.
  Source(SourceStage),
  /// Element transformation.
  Transform(TransformStage),
  /// External endpoint spliced mid-chain.
  Fan(FanStage),
  /// Element consumption; only valid as the last stage.
  Terminal(TerminalStage),
}

impl Stage {
  /// Short label for diagnostics and error context.
  pub fn name(&self) -> &'static str {
    match self {
      Stage::Source(SourceStage::Iterable(_)) => "iterable",
      Stage::Source(SourceStage::SuppliedPublisher(_)) => "publisher",
      Stage::Source(SourceStage::Empty) => "empty",
      Stage::Source(SourceStage::Failed(_)) => "failed",
      Stage::Transform(TransformStage::Map(_)) => "map",
      Stage::Transform(TransformStage::Filter(_)) => "filter",
      Stage::Transform(TransformStage::FlatMap(_)) => "flat_map",
      Stage::Transform(TransformStage::FlatMapIterable(_)) => "flat_map_iterable",
      Stage::Transform(TransformStage::Peek(_)) => "peek",
      Stage::Transform(TransformStage::OnError(_)) => "on_error",
      Stage::Transform(TransformStage::OnTerminate(_)) => "on_terminate",
      Stage::Transform(TransformStage::Take(_)) => "take",
      Stage::Transform(TransformStage::Skip(_)) => "skip",
      Stage::Fan(FanStage::Via(_)) => "via",
      Stage::Terminal(TerminalStage::ToSubscriber(_)) => "to",
      Stage::Terminal(TerminalStage::Collect { .. }) => "collect",
      Stage::Terminal(TerminalStage::FindFirst) => "find_first",
      Stage::Terminal(TerminalStage::Ignore) => "ignore",
      Stage::Terminal(TerminalStage::Cancel) => "cancel",
    }
  }

  /// Whether this stage embeds a single-use endpoint, tainting its graph.
  pub fn is_single_use(&self) -> bool {
    matches!(
      self,
      Stage::Fan(FanStage::Via(_)) | Stage::Terminal(TerminalStage::ToSubscriber(_))
    )
  }
}

impl std::fmt::Debug for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_use_yields_once() {
    let cell = SingleUse::new(7);
    assert_eq!(cell.take().unwrap(), 7);
    assert_eq!(cell.take().unwrap_err(), BuildError::TaintedReuse);
  }

  #[test]
  fn single_use_clones_share_the_claim() {
    let cell = SingleUse::new("endpoint");
    let other = cell.clone();
    assert!(other.take().is_ok());
    assert_eq!(cell.take().unwrap_err(), BuildError::TaintedReuse);
  }

  #[test]
  fn stage_names_and_taint() {
    let take = Stage::Transform(TransformStage::Take(3));
    assert_eq!(take.name(), "take");
    assert!(!take.is_single_use());
    let cancel = Stage::Terminal(TerminalStage::Cancel);
    assert!(!cancel.is_single_use());
  }
}

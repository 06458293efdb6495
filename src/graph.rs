//! # Stage Graph
//!
//! A [`Graph`] is an ordered, validated sequence of [`Stage`]s describing a
//! full or partial pipeline. Graphs are persistent values: every builder
//! operation produces a new graph with one stage appended, leaving the prior
//! value intact, so partially built graphs can be shared freely before
//! materialization.
//!
//! Structure invariants:
//!
//! - a source stage appears only at position 0;
//! - a terminal stage appears only at the last position;
//! - a graph embedding a single-use endpoint (an external subscriber or
//!   processor) is **tainted** and survives exactly one materialization; all
//!   later attempts fail with [`BuildError::TaintedReuse`] because the
//!   endpoint's own single-subscription contract cannot be re-satisfied.
//!
//! Materialization consumes the graph by value. An untainted graph may be
//! cloned and materialized any number of times; each materialization gets an
//! independent running pipeline.

use crate::error::BuildError;
use crate::stage::Stage;

/// Ordered, validated sequence of pipeline stages.
#[derive(Clone, Default)]
pub struct Graph {
  stages: Vec<Stage>,
  tainted: bool,
}

impl Graph {
  /// Creates an empty graph (no source, no stages).
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Returns a new graph equal to this one with `stage` appended.
  pub(crate) fn appended(&self, stage: Stage) -> Self {
    if stage.is_single_use() && !self.tainted {
      tracing::warn!(
        stage = stage.name(),
        "graph embeds a single-use endpoint and can be materialized at most once"
      );
    }
    let tainted = self.tainted || stage.is_single_use();
    let mut stages = self.stages.clone();
    stages.push(stage);
    Self { stages, tainted }
  }

  /// The stage sequence, in pipeline order.
  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  /// Whether this graph embeds a single-use endpoint and therefore survives
  /// at most one materialization.
  pub fn is_tainted(&self) -> bool {
    self.tainted
  }

  /// Whether the graph begins with a source stage.
  pub fn has_source(&self) -> bool {
    matches!(self.stages.first(), Some(Stage::Source(_)))
  }

  /// Whether the graph ends with a terminal stage.
  pub fn has_terminal(&self) -> bool {
    matches!(self.stages.last(), Some(Stage::Terminal(_)))
  }

  /// Consumes the graph, yielding its stages.
  pub(crate) fn into_stages(self) -> Vec<Stage> {
    self.stages
  }

  /// Checks the positional invariants: source only first, terminal only last.
  pub fn validate(&self) -> Result<(), BuildError> {
    for (index, stage) in self.stages.iter().enumerate() {
      if matches!(stage, Stage::Source(_)) && index != 0 {
        return Err(BuildError::GraphStructure(format!(
          "source stage '{}' at position {index}, sources are only valid first",
          stage.name()
        )));
      }
      if matches!(stage, Stage::Terminal(_)) && index + 1 != self.stages.len() {
        return Err(BuildError::GraphStructure(format!(
          "terminal stage '{}' at position {index}, terminals are only valid last",
          stage.name()
        )));
      }
    }
    Ok(())
  }

  /// Checks the shape required to materialize a cold publisher: a leading
  /// source and no terminal.
  pub fn ensure_publisher_shape(&self) -> Result<(), BuildError> {
    self.validate()?;
    if !self.has_source() {
      return Err(BuildError::EmptyGraph);
    }
    if self.has_terminal() {
      return Err(BuildError::GraphStructure(
        "terminal stage present in a graph materialized as a publisher".to_string(),
      ));
    }
    Ok(())
  }

  /// Checks the shape required to materialize a processor: transforms only.
  pub fn ensure_processor_shape(&self) -> Result<(), BuildError> {
    self.validate()?;
    if self.has_source() {
      return Err(BuildError::GraphStructure(
        "source stage present in a graph materialized as a processor".to_string(),
      ));
    }
    if self.has_terminal() {
      return Err(BuildError::GraphStructure(
        "terminal stage present in a graph materialized as a processor".to_string(),
      ));
    }
    Ok(())
  }

  /// Checks the shape required to materialize a subscriber: no source, a
  /// trailing terminal.
  pub fn ensure_subscriber_shape(&self) -> Result<(), BuildError> {
    self.validate()?;
    if self.has_source() {
      return Err(BuildError::GraphStructure(
        "source stage present in a graph materialized as a subscriber".to_string(),
      ));
    }
    if !self.has_terminal() {
      return Err(BuildError::GraphStructure(
        "graph materialized as a subscriber lacks a terminal stage".to_string(),
      ));
    }
    Ok(())
  }

  /// Checks the shape required for an immediately started run: both a source
  /// and a terminal.
  pub fn ensure_run_shape(&self) -> Result<(), BuildError> {
    self.validate()?;
    if !self.has_source() {
      return Err(BuildError::EmptyGraph);
    }
    if !self.has_terminal() {
      return Err(BuildError::GraphStructure(
        "graph started as a run lacks a terminal stage".to_string(),
      ));
    }
    Ok(())
  }
}

impl std::fmt::Debug for Graph {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Graph")
      .field("stages", &self.stages)
      .field("tainted", &self.tainted)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stage::{SourceStage, TerminalStage, TransformStage};

  fn iterable() -> Stage {
    Stage::Source(SourceStage::Empty)
  }

  fn take(n: u64) -> Stage {
    Stage::Transform(TransformStage::Take(n))
  }

  #[test]
  fn append_is_persistent() {
    let empty = Graph::new();
    let sourced = empty.appended(iterable());
    assert_eq!(empty.stages().len(), 0);
    assert_eq!(sourced.stages().len(), 1);
    let longer = sourced.appended(take(2));
    assert_eq!(sourced.stages().len(), 1);
    assert_eq!(longer.stages().len(), 2);
  }

  #[test]
  fn shape_checks() {
    let publisher = Graph::new().appended(iterable()).appended(take(1));
    assert!(publisher.ensure_publisher_shape().is_ok());
    assert!(publisher.ensure_processor_shape().is_err());
    assert!(publisher.ensure_run_shape().is_err());

    let processor = Graph::new().appended(take(1));
    assert!(processor.ensure_processor_shape().is_ok());
    assert_eq!(
      processor.ensure_publisher_shape().unwrap_err(),
      BuildError::EmptyGraph
    );

    let run = publisher.appended(Stage::Terminal(TerminalStage::Ignore));
    assert!(run.ensure_run_shape().is_ok());
    assert!(run.ensure_publisher_shape().is_err());
  }

  #[test]
  fn positional_invariants() {
    let bad = Graph::new().appended(take(1)).appended(iterable());
    assert!(matches!(
      bad.validate(),
      Err(BuildError::GraphStructure(_))
    ));
  }

  #[test]
  fn taint_tracks_single_use_stages() {
    use crate::error::StreamError;
    use crate::spi::{AnyItem, Subscriber, Subscription};
    use std::sync::Arc;

    struct Discard;

    impl Subscriber<AnyItem> for Discard {
      fn on_subscribe(&self, _subscription: Arc<dyn Subscription>) {}
      fn on_next(&self, _element: AnyItem) {}
      fn on_error(&self, _error: StreamError) {}
      fn on_complete(&self) {}
    }

    let clean = Graph::new().appended(iterable()).appended(take(1));
    assert!(!clean.is_tainted());
    let tainted = clean.appended(Stage::Terminal(TerminalStage::ToSubscriber(
      crate::stage::SingleUse::new(Arc::new(Discard) as Arc<dyn Subscriber<AnyItem>>),
    )));
    assert!(tainted.is_tainted());
    assert!(tainted.clone().is_tainted());
  }
}

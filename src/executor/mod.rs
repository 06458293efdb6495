//! # Runtime Stage-Graph Executor
//!
//! Turns a validated [`Graph`] into running primitives. Every materialized
//! pipeline is one [`signal::PipelineCell`]: a serialized signal queue plus a
//! [`interpreter::Interpreter`] holding all per-run state. The small boundary
//! types in this module are the only objects the outside world touches; each
//! one forwards its calls into the owning cell's queue, which is what makes
//! signal delivery serialized and re-entrancy safe.
//!
//! Graphs embedding external processors (`via`) are assembled as a chain of
//! pipeline segments: the segment upstream of the processor is wired to the
//! processor's subscriber half at materialization time, and the next segment
//! treats the processor's publisher half as its supplied upstream. Demand
//! still travels end to end, one edge at a time.

pub(crate) mod demand;
pub(crate) mod interpreter;
pub(crate) mod signal;

use std::sync::Arc;

use tracing::debug;

use crate::completion::RawCompletion;
use crate::error::{BuildError, StreamError};
use crate::graph::Graph;
use crate::spi::{AnyItem, Processor, Publisher, Subscriber, Subscription};
use crate::stage::{
  FanStage, ProcessorEndpoint, SourceStage, Stage, TerminalStage, TransformStage,
};

use interpreter::{Interpreter, OpState, SinkState, UpstreamState};
use signal::{Event, PipelineCell};

pub(crate) use interpreter::FirstResult;

/// Subscription handed to whoever subscribes to a pipeline's publisher end.
pub(crate) struct DownstreamSubscription {
  pub(crate) cell: Arc<PipelineCell>,
}

impl Subscription for DownstreamSubscription {
  fn request(&self, n: u64) {
    self.cell.signal(Event::Request(n));
  }

  fn cancel(&self) {
    self.cell.signal(Event::CancelDownstream);
  }
}

/// Subscription granted to a subscriber the pipeline had to turn away.
pub(crate) struct InertSubscription;

impl Subscription for InertSubscription {
  fn request(&self, _n: u64) {}

  fn cancel(&self) {}
}

/// The subscriber end of a pipeline: external upstreams push elements here.
pub(crate) struct PipelineEntry {
  pub(crate) cell: Arc<PipelineCell>,
}

impl Subscriber<AnyItem> for PipelineEntry {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    self.cell.signal(Event::UpstreamSubscribed(subscription));
  }

  fn on_next(&self, element: AnyItem) {
    self.cell.signal(Event::UpstreamNext(element));
  }

  fn on_error(&self, error: StreamError) {
    self.cell.signal(Event::UpstreamError(error));
  }

  fn on_complete(&self) {
    self.cell.signal(Event::UpstreamComplete);
  }
}

/// The publisher end of a pipeline.
pub(crate) struct PipelineExit {
  pub(crate) cell: Arc<PipelineCell>,
}

impl Publisher<AnyItem> for PipelineExit {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<AnyItem>>) {
    self.cell.signal(Event::DownstreamSubscribed(subscriber));
  }
}

/// Subscriber attached to an inner flat-map stream, tagged with the operator
/// index it feeds.
pub(crate) struct InnerTap {
  pub(crate) cell: Arc<PipelineCell>,
  pub(crate) op: usize,
}

impl Subscriber<AnyItem> for InnerTap {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    self.cell.signal(Event::InnerSubscribed {
      op: self.op,
      subscription,
    });
  }

  fn on_next(&self, element: AnyItem) {
    self.cell.signal(Event::InnerNext {
      op: self.op,
      item: element,
    });
  }

  fn on_error(&self, error: StreamError) {
    self.cell.signal(Event::InnerError {
      op: self.op,
      error,
    });
  }

  fn on_complete(&self) {
    self.cell.signal(Event::InnerComplete { op: self.op });
  }
}

/// A processor assembled from a pipeline's entry and exit ends.
pub(crate) struct CompositeProcessor {
  entry: Arc<dyn Subscriber<AnyItem>>,
  exit: Arc<dyn Publisher<AnyItem>>,
}

impl Subscriber<AnyItem> for CompositeProcessor {
  fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
    self.entry.on_subscribe(subscription);
  }

  fn on_next(&self, element: AnyItem) {
    self.entry.on_next(element);
  }

  fn on_error(&self, error: StreamError) {
    self.entry.on_error(error);
  }

  fn on_complete(&self) {
    self.entry.on_complete();
  }
}

impl Publisher<AnyItem> for CompositeProcessor {
  fn subscribe(&self, subscriber: Arc<dyn Subscriber<AnyItem>>) {
    self.exit.subscribe(subscriber);
  }
}

impl Processor<AnyItem, AnyItem> for CompositeProcessor {}

/// Starts a prepared source-to-terminal run when invoked. Lets an engine
/// choose the thread the drive begins on.
pub(crate) struct RunDriver {
  cell: Arc<PipelineCell>,
}

impl RunDriver {
  pub(crate) fn start(self) {
    self.cell.signal(Event::Activate);
  }
}

// -------------------------------------------------------------------------
// Graph resolution
// -------------------------------------------------------------------------

enum ResolvedTerminal {
  ToSubscriber(Arc<dyn Subscriber<AnyItem>>),
  Collect {
    supply: crate::stage::CollectSupply,
    accumulate: crate::stage::CollectAccumulate,
    finish: crate::stage::CollectFinish,
  },
  FindFirst,
  Ignore,
  Cancel,
}

struct ResolvedGraph {
  source: Option<SourceStage>,
  segments: Vec<Vec<OpState>>,
  vias: Vec<ProcessorEndpoint>,
  terminal: Option<ResolvedTerminal>,
}

fn resolve(graph: Graph) -> Result<ResolvedGraph, BuildError> {
  let mut source = None;
  let mut segments: Vec<Vec<OpState>> = vec![Vec::new()];
  let mut vias = Vec::new();
  let mut terminal = None;
  for stage in graph.into_stages() {
    match stage {
      Stage::Source(s) => source = Some(s),
      Stage::Transform(t) => segments
        .last_mut()
        .expect("segment list is never empty")
        .push(op_state(t)),
      Stage::Fan(FanStage::Via(cell)) => {
        vias.push(cell.take()?);
        segments.push(Vec::new());
      }
      Stage::Terminal(t) => terminal = Some(resolve_terminal(t)?),
    }
  }
  Ok(ResolvedGraph {
    source,
    segments,
    vias,
    terminal,
  })
}

fn op_state(stage: TransformStage) -> OpState {
  match stage {
    TransformStage::Map(f) => OpState::Map(f),
    TransformStage::Filter(p) => OpState::Filter(p),
    TransformStage::FlatMap(f) => OpState::FlatMap { f, inner: None },
    TransformStage::FlatMapIterable(f) => OpState::FlatMapIterable { f, inner: None },
    TransformStage::Peek(f) => OpState::Peek(f),
    TransformStage::OnError(hook) => OpState::OnError { hook },
    TransformStage::OnTerminate(hook) => OpState::OnTerminate { hook, fired: false },
    TransformStage::Take(n) => OpState::Take { remaining: n },
    TransformStage::Skip(n) => OpState::Skip { remaining: n },
  }
}

fn resolve_terminal(stage: TerminalStage) -> Result<ResolvedTerminal, BuildError> {
  Ok(match stage {
    TerminalStage::ToSubscriber(cell) => ResolvedTerminal::ToSubscriber(cell.take()?),
    TerminalStage::Collect {
      supply,
      accumulate,
      finish,
    } => ResolvedTerminal::Collect {
      supply,
      accumulate,
      finish,
    },
    TerminalStage::FindFirst => ResolvedTerminal::FindFirst,
    TerminalStage::Ignore => ResolvedTerminal::Ignore,
    TerminalStage::Cancel => ResolvedTerminal::Cancel,
  })
}

fn upstream_from_source(source: SourceStage) -> UpstreamState {
  match source {
    SourceStage::Iterable(supplier) => UpstreamState::iterable(supplier()),
    SourceStage::SuppliedPublisher(publisher) => UpstreamState::supplied(publisher),
    SourceStage::Empty => UpstreamState::empty(),
    SourceStage::Failed(error) => UpstreamState::failed(error),
  }
}

fn sink_from_terminal(terminal: ResolvedTerminal) -> (SinkState, Arc<RawCompletion>) {
  let completion = Arc::new(RawCompletion::new());
  let sink = match terminal {
    ResolvedTerminal::ToSubscriber(subscriber) => SinkState::External {
      subscriber: Some(subscriber),
      completion: Some(Arc::clone(&completion)),
    },
    ResolvedTerminal::Collect {
      supply,
      accumulate,
      finish,
    } => SinkState::Collect {
      acc: Some(supply()),
      accumulate,
      finish,
      completion: Arc::clone(&completion),
    },
    ResolvedTerminal::FindFirst => SinkState::First {
      completion: Arc::clone(&completion),
    },
    ResolvedTerminal::Ignore => SinkState::Ignore {
      completion: Arc::clone(&completion),
    },
    ResolvedTerminal::Cancel => SinkState::CancelNow {
      completion: Arc::clone(&completion),
    },
  };
  (sink, completion)
}

enum Head {
  Source(SourceStage),
  Entry,
}

/// Builds the segment chain for a resolved graph, wiring each intermediate
/// segment into its via processor. Returns the first and last cells.
fn build_chain(
  head: Head,
  segments: Vec<Vec<OpState>>,
  vias: Vec<ProcessorEndpoint>,
  final_sink: SinkState,
  label: &'static str,
) -> (Arc<PipelineCell>, Arc<PipelineCell>) {
  let count = segments.len();
  let mut vias = vias.into_iter();
  let mut final_sink = Some(final_sink);
  let mut next_upstream = Some(match head {
    Head::Source(source) => upstream_from_source(source),
    Head::Entry => UpstreamState::entry(),
  });
  let mut first: Option<Arc<PipelineCell>> = None;
  let mut last: Option<Arc<PipelineCell>> = None;
  for (index, ops) in segments.into_iter().enumerate() {
    let upstream = next_upstream.take().expect("upstream prepared for segment");
    let via = if index + 1 < count { vias.next() } else { None };
    let sink = match &via {
      Some(endpoint) => {
        next_upstream = Some(UpstreamState::supplied(Arc::clone(&endpoint.publisher)));
        SinkState::External {
          subscriber: None,
          completion: None,
        }
      }
      None => final_sink.take().expect("final sink prepared"),
    };
    let cell = PipelineCell::create(|weak| Interpreter::new(weak, label, upstream, ops, sink));
    if first.is_none() {
      first = Some(Arc::clone(&cell));
    }
    if let Some(endpoint) = via {
      cell.signal(Event::DownstreamSubscribed(endpoint.subscriber));
    }
    last = Some(cell);
  }
  let first = first.expect("chain has at least one segment");
  let last = last.expect("chain has at least one segment");
  (first, last)
}

// -------------------------------------------------------------------------
// Materializers
// -------------------------------------------------------------------------

/// Materializes a source-led, terminal-free graph into a cold publisher.
pub(crate) fn materialize_publisher(
  graph: Graph,
) -> Result<Arc<dyn Publisher<AnyItem>>, BuildError> {
  graph.ensure_publisher_shape()?;
  debug!(stages = graph.stages().len(), "materializing publisher");
  let resolved = resolve(graph)?;
  let source = resolved.source.ok_or(BuildError::EmptyGraph)?;
  let (_, exit) = build_chain(
    Head::Source(source),
    resolved.segments,
    resolved.vias,
    SinkState::External {
      subscriber: None,
      completion: None,
    },
    "publisher",
  );
  Ok(Arc::new(PipelineExit { cell: exit }))
}

/// Materializes a transform-only graph into a processor.
pub(crate) fn materialize_processor(
  graph: Graph,
) -> Result<Arc<dyn Processor<AnyItem, AnyItem>>, BuildError> {
  graph.ensure_processor_shape()?;
  debug!(stages = graph.stages().len(), "materializing processor");
  let resolved = resolve(graph)?;
  let (entry_cell, exit_cell) = build_chain(
    Head::Entry,
    resolved.segments,
    resolved.vias,
    SinkState::External {
      subscriber: None,
      completion: None,
    },
    "processor",
  );
  Ok(Arc::new(CompositeProcessor {
    entry: Arc::new(PipelineEntry { cell: entry_cell }),
    exit: Arc::new(PipelineExit { cell: exit_cell }),
  }))
}

/// Materializes an unsourced, terminal-ended graph into a subscriber plus
/// the completion resolved by its terminal.
pub(crate) fn materialize_subscriber(
  graph: Graph,
) -> Result<(Arc<dyn Subscriber<AnyItem>>, Arc<RawCompletion>), BuildError> {
  graph.ensure_subscriber_shape()?;
  debug!(stages = graph.stages().len(), "materializing subscriber");
  let resolved = resolve(graph)?;
  let terminal = resolved.terminal.ok_or_else(|| {
    BuildError::GraphStructure("subscriber graph lacks a terminal stage".to_string())
  })?;
  let (sink, completion) = sink_from_terminal(terminal);
  let (entry_cell, exit_cell) = build_chain(
    Head::Entry,
    resolved.segments,
    resolved.vias,
    sink,
    "subscriber",
  );
  exit_cell.signal(Event::Activate);
  Ok((
    Arc::new(PipelineEntry { cell: entry_cell }),
    completion,
  ))
}

/// Prepares a source-led, terminal-ended graph without starting it. The
/// returned driver begins execution when invoked; the completion resolves
/// when the run finishes.
pub(crate) fn prepare_run(
  graph: Graph,
) -> Result<(Arc<RawCompletion>, RunDriver), BuildError> {
  graph.ensure_run_shape()?;
  debug!(stages = graph.stages().len(), "materializing run");
  let resolved = resolve(graph)?;
  let source = resolved.source.ok_or(BuildError::EmptyGraph)?;
  let terminal = resolved
    .terminal
    .ok_or_else(|| BuildError::GraphStructure("run graph lacks a terminal stage".to_string()))?;
  let (sink, completion) = sink_from_terminal(terminal);
  let (_, exit_cell) = build_chain(
    Head::Source(source),
    resolved.segments,
    resolved.vias,
    sink,
    "run",
  );
  Ok((completion, RunDriver { cell: exit_cell }))
}

/// Materializes and immediately starts a source-to-terminal run on the
/// calling thread.
pub(crate) fn materialize_run(graph: Graph) -> Result<Arc<RawCompletion>, BuildError> {
  let (completion, driver) = prepare_run(graph)?;
  driver.start();
  Ok(completion)
}

//! # Stage Interpreter
//!
//! The per-materialization state machine behind every primitive the crate
//! produces. One interpreter owns all mutable state of a running pipeline:
//! the source cursor or upstream accounting, per-operator cursors, the
//! downstream demand counter and the terminal flag.
//!
//! ## State machine
//!
//! A pipeline moves `Idle -> Active -> {Completed | Errored | Cancelled}`.
//! Terminal states are absorbing: once reached, every further signal is
//! dropped and nothing is delivered downstream again.
//!
//! ## Production model
//!
//! Elements are pulled through the operator chain on demand. Each drain pass
//! first applies queued signals, then produces while downstream demand
//! remains. A pull that reaches a starved external upstream parks the
//! pipeline and records how much to request; production resumes when the
//! requested elements arrive. Inner flat-map streams are drained fully and
//! in order, one at a time, before the next outer element is consumed.
//!
//! ## Demand discipline
//!
//! Elements are emitted only against downstream demand, which accumulates in
//! a saturating counter. Upstream demand is issued conservatively, one
//! element at a time, unless downstream demand is unbounded; operators that
//! drop elements (filter, skip) simply trigger another single-element
//! request, so cumulative delivery can never exceed cumulative request on
//! any edge.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::completion::RawCompletion;
use crate::error::{StreamError, StreamErrorKind};
use crate::spi::{AnyItem, Publisher, Subscriber, Subscription, any_item};
use crate::stage::{
  CollectAccumulate, CollectFinish, ErrorHook, FilterFn, FlatMapFn, FlatMapIterFn, MapFn, PeekFn,
  TerminateHook,
};

use super::demand::DemandCounter;
use super::signal::{Event, PipelineCell};
use super::{DownstreamSubscription, InertSubscription, InnerTap};

/// Value resolved by a find-first terminal; unwrapped by the typed facade.
pub(crate) struct FirstResult(pub(crate) Option<AnyItem>);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PipeState {
  Idle,
  Active,
  Completed,
  Errored,
  Cancelled,
}

/// Accounting for one external element feed (the pipeline upstream or an
/// inner flat-map stream).
pub(crate) struct Link {
  subscription: Option<Arc<dyn Subscription>>,
  buffered: VecDeque<AnyItem>,
  requested: DemandCounter,
  done: bool,
}

impl Link {
  fn new() -> Self {
    Self {
      subscription: None,
      buffered: VecDeque::new(),
      requested: DemandCounter::new(),
      done: false,
    }
  }

  fn release(&mut self) {
    if let Some(subscription) = self.subscription.take() {
      subscription.cancel();
    }
    self.buffered.clear();
    self.requested.clear();
  }
}

/// Where this pipeline's elements come from.
pub(crate) enum UpstreamState {
  /// A supplier-provided iterator, with one element of lookahead so
  /// exhaustion is noticed as soon as the last element is emitted.
  Iterable {
    iter: Box<dyn Iterator<Item = AnyItem> + Send>,
    lookahead: Option<AnyItem>,
    done: bool,
  },
  /// An externally authored publisher, subscribed when the pipeline starts.
  Supplied {
    publisher: Option<Arc<dyn Publisher<AnyItem>>>,
    link: Link,
  },
  /// The pipeline itself is the subscriber; elements are pushed in.
  Entry { link: Link },
  /// No elements at all.
  Empty { done: bool },
  /// Fails as soon as the pipeline starts.
  Failed { error: Option<StreamError> },
}

impl UpstreamState {
  pub(crate) fn iterable(iter: Box<dyn Iterator<Item = AnyItem> + Send>) -> Self {
    UpstreamState::Iterable {
      iter,
      lookahead: None,
      done: false,
    }
  }

  pub(crate) fn supplied(publisher: Arc<dyn Publisher<AnyItem>>) -> Self {
    UpstreamState::Supplied {
      publisher: Some(publisher),
      link: Link::new(),
    }
  }

  pub(crate) fn entry() -> Self {
    UpstreamState::Entry { link: Link::new() }
  }

  pub(crate) fn empty() -> Self {
    UpstreamState::Empty { done: false }
  }

  pub(crate) fn failed(error: StreamError) -> Self {
    UpstreamState::Failed { error: Some(error) }
  }
}

/// Per-materialization operator state.
pub(crate) enum OpState {
  Map(MapFn),
  Filter(FilterFn),
  Peek(PeekFn),
  FlatMap { f: FlatMapFn, inner: Option<Link> },
  FlatMapIterable {
    f: FlatMapIterFn,
    inner: Option<Box<dyn Iterator<Item = AnyItem> + Send>>,
  },
  OnError { hook: ErrorHook },
  OnTerminate { hook: TerminateHook, fired: bool },
  Take { remaining: u64 },
  Skip { remaining: u64 },
}

/// Where this pipeline's elements go.
pub(crate) enum SinkState {
  /// An external subscriber; either attached later through the publisher
  /// end, or embedded at build time (a `to` terminal, which also resolves a
  /// completion).
  External {
    subscriber: Option<Arc<dyn Subscriber<AnyItem>>>,
    completion: Option<Arc<RawCompletion>>,
  },
  /// Folds every element into an accumulator.
  Collect {
    acc: Option<AnyItem>,
    accumulate: CollectAccumulate,
    finish: CollectFinish,
    completion: Arc<RawCompletion>,
  },
  /// Resolves with the first element, then cancels upstream.
  First { completion: Arc<RawCompletion> },
  /// Discards elements, resolving on the terminal signal.
  Ignore { completion: Arc<RawCompletion> },
  /// Cancels as soon as the pipeline starts.
  CancelNow { completion: Arc<RawCompletion> },
  /// Terminal already delivered; nothing is attached any more.
  Detached,
}

enum Pulled {
  Item(AnyItem),
  Pending,
  Finished,
  Failed { error: StreamError, origin: usize },
}

pub(crate) struct Interpreter {
  cell: Weak<PipelineCell>,
  label: &'static str,
  upstream: UpstreamState,
  ops: Vec<OpState>,
  sink: SinkState,
  demand: DemandCounter,
  state: PipeState,
  started: bool,
  want_upstream: bool,
  want_inner: Vec<usize>,
  pending_failure: Option<StreamError>,
}

impl Interpreter {
  pub(crate) fn new(
    cell: Weak<PipelineCell>,
    label: &'static str,
    upstream: UpstreamState,
    ops: Vec<OpState>,
    sink: SinkState,
  ) -> Self {
    Self {
      cell,
      label,
      upstream,
      ops,
      sink,
      demand: DemandCounter::new(),
      state: PipeState::Idle,
      started: false,
      want_upstream: false,
      want_inner: Vec::new(),
      pending_failure: None,
    }
  }

  fn is_terminal(&self) -> bool {
    matches!(
      self.state,
      PipeState::Completed | PipeState::Errored | PipeState::Cancelled
    )
  }

  // ---------------------------------------------------------------------
  // Signal handling
  // ---------------------------------------------------------------------

  pub(crate) fn handle(&mut self, event: Event) {
    match event {
      Event::Activate => self.activate(),
      Event::DownstreamSubscribed(subscriber) => self.on_downstream_subscribed(subscriber),
      Event::Request(n) => self.on_request(n),
      Event::CancelDownstream => self.on_cancel(),
      Event::UpstreamSubscribed(subscription) => self.on_upstream_subscribed(subscription),
      Event::UpstreamNext(item) => self.on_upstream_next(item),
      Event::UpstreamError(error) => {
        if !self.is_terminal() {
          self.fail(0, error);
        }
      }
      Event::UpstreamComplete => self.on_upstream_complete(),
      Event::InnerSubscribed { op, subscription } => self.on_inner_subscribed(op, subscription),
      Event::InnerNext { op, item } => self.on_inner_next(op, item),
      Event::InnerError { op, error } => self.on_inner_error(op, error),
      Event::InnerComplete { op } => self.on_inner_complete(op),
    }
  }

  fn activate(&mut self) {
    if self.state != PipeState::Idle {
      return;
    }
    debug!(pipeline = self.label, "pipeline activated");
    self.state = PipeState::Active;
    enum Policy {
      Grant(Arc<dyn Subscriber<AnyItem>>),
      Unbounded,
      One,
      CancelNow,
      Nothing,
    }
    let policy = match &self.sink {
      SinkState::External {
        subscriber: Some(subscriber),
        ..
      } => Policy::Grant(Arc::clone(subscriber)),
      SinkState::External { .. } | SinkState::Detached => Policy::Nothing,
      SinkState::Collect { .. } | SinkState::Ignore { .. } => Policy::Unbounded,
      SinkState::First { .. } => Policy::One,
      SinkState::CancelNow { .. } => Policy::CancelNow,
    };
    match policy {
      Policy::Grant(subscriber) => self.grant_downstream(&subscriber),
      Policy::Unbounded => self.demand.make_unbounded(),
      Policy::One => {
        let _ = self.demand.add(1, "find_first");
      }
      Policy::CancelNow => {
        if let SinkState::CancelNow { completion } =
          std::mem::replace(&mut self.sink, SinkState::Detached)
        {
          completion.resolve(Ok(any_item(())));
        }
        self.terminalize_cancel();
        return;
      }
      Policy::Nothing => {}
    }
    self.start_source();
  }

  fn on_downstream_subscribed(&mut self, incoming: Arc<dyn Subscriber<AnyItem>>) {
    match self.state {
      PipeState::Idle => {
        let installed = match &mut self.sink {
          SinkState::External { subscriber, .. } if subscriber.is_none() => {
            *subscriber = Some(Arc::clone(&incoming));
            true
          }
          _ => false,
        };
        if !installed {
          self.reject_subscriber(&incoming);
          return;
        }
        self.state = PipeState::Active;
        self.grant_downstream(&incoming);
        self.start_source();
      }
      PipeState::Active => self.reject_subscriber(&incoming),
      _ => {
        // The pipeline already terminated with nobody attached; hand the
        // late subscriber the stored outcome.
        incoming.on_subscribe(Arc::new(InertSubscription));
        match self.pending_failure.take() {
          Some(error) => incoming.on_error(error),
          None => incoming.on_complete(),
        }
      }
    }
  }

  fn reject_subscriber(&self, subscriber: &Arc<dyn Subscriber<AnyItem>>) {
    warn!(pipeline = self.label, "second subscriber rejected");
    subscriber.on_subscribe(Arc::new(InertSubscription));
    subscriber.on_error(StreamError::protocol(
      "subscribe",
      "pipeline already has a subscriber",
    ));
  }

  fn on_request(&mut self, n: u64) {
    if self.is_terminal() {
      return;
    }
    if let Err(error) = self.demand.add(n, "downstream") {
      let origin = self.ops.len();
      self.fail(origin, error);
    }
  }

  fn on_cancel(&mut self) {
    if self.is_terminal() {
      return;
    }
    debug!(pipeline = self.label, "cancelled by downstream");
    if let SinkState::External {
      completion: Some(completion),
      ..
    } = &self.sink
    {
      completion.resolve(Ok(any_item(())));
    }
    self.terminalize_cancel();
  }

  fn on_upstream_subscribed(&mut self, subscription: Arc<dyn Subscription>) {
    if self.is_terminal() {
      subscription.cancel();
      return;
    }
    match self.upstream_link() {
      Some(link) if link.subscription.is_none() => link.subscription = Some(subscription),
      // A second upstream subscription, or an upstream that should not
      // exist for this shape: refuse it.
      _ => subscription.cancel(),
    }
  }

  fn on_upstream_next(&mut self, item: AnyItem) {
    if self.is_terminal() {
      return;
    }
    let ok = match self.upstream_link() {
      Some(link) => {
        if link.requested.consume_one() {
          link.buffered.push_back(item);
          true
        } else {
          false
        }
      }
      None => return,
    };
    if !ok {
      warn!(pipeline = self.label, "upstream delivered beyond demand");
      self.fail(
        0,
        StreamError::protocol("upstream", "element delivered without outstanding demand"),
      );
    }
  }

  fn on_upstream_complete(&mut self) {
    if self.is_terminal() {
      return;
    }
    if let Some(link) = self.upstream_link() {
      link.done = true;
    }
  }

  fn on_inner_subscribed(&mut self, op: usize, subscription: Arc<dyn Subscription>) {
    if self.is_terminal() {
      subscription.cancel();
      return;
    }
    match self.ops.get_mut(op) {
      Some(OpState::FlatMap {
        inner: Some(link), ..
      }) if link.subscription.is_none() => link.subscription = Some(subscription),
      _ => subscription.cancel(),
    }
  }

  fn on_inner_next(&mut self, op: usize, item: AnyItem) {
    if self.is_terminal() {
      return;
    }
    let ok = match self.ops.get_mut(op) {
      Some(OpState::FlatMap {
        inner: Some(link), ..
      }) => {
        if link.requested.consume_one() {
          link.buffered.push_back(item);
          true
        } else {
          false
        }
      }
      _ => return,
    };
    if !ok {
      self.fail(
        op + 1,
        StreamError::protocol("flat_map", "inner element delivered without outstanding demand"),
      );
    }
  }

  fn on_inner_error(&mut self, op: usize, error: StreamError) {
    if self.is_terminal() {
      return;
    }
    if matches!(
      self.ops.get(op),
      Some(OpState::FlatMap { inner: Some(_), .. })
    ) {
      self.fail(op + 1, error);
    }
  }

  fn on_inner_complete(&mut self, op: usize) {
    if self.is_terminal() {
      return;
    }
    if let Some(OpState::FlatMap {
      inner: Some(link), ..
    }) = self.ops.get_mut(op)
    {
      link.done = true;
    }
  }

  // ---------------------------------------------------------------------
  // Activation helpers
  // ---------------------------------------------------------------------

  fn grant_downstream(&mut self, subscriber: &Arc<dyn Subscriber<AnyItem>>) {
    let Some(cell) = self.cell.upgrade() else {
      return;
    };
    let subscription: Arc<dyn Subscription> = Arc::new(DownstreamSubscription { cell });
    subscriber.on_subscribe(subscription);
  }

  fn start_source(&mut self) {
    if self.started || self.is_terminal() {
      return;
    }
    self.started = true;
    match &mut self.upstream {
      UpstreamState::Iterable {
        iter,
        lookahead,
        done,
      } => match iter.next() {
        Some(item) => *lookahead = Some(item),
        None => *done = true,
      },
      UpstreamState::Supplied { publisher, .. } => {
        let Some(publisher) = publisher.take() else {
          return;
        };
        let Some(cell) = self.cell.upgrade() else {
          return;
        };
        publisher.subscribe(Arc::new(super::PipelineEntry { cell }));
      }
      UpstreamState::Entry { .. } => {}
      UpstreamState::Empty { done } => *done = true,
      UpstreamState::Failed { error } => {
        let error = error
          .take()
          .unwrap_or_else(|| StreamError::internal("source", "failure already consumed"));
        self.fail(0, error);
      }
    }
  }

  fn upstream_link(&mut self) -> Option<&mut Link> {
    match &mut self.upstream {
      UpstreamState::Supplied { link, .. } | UpstreamState::Entry { link } => Some(link),
      _ => None,
    }
  }

  // ---------------------------------------------------------------------
  // Production
  // ---------------------------------------------------------------------

  pub(crate) fn advance(&mut self) {
    loop {
      if self.state != PipeState::Active {
        return;
      }
      if self.has_pending_events() {
        // Let the drain loop apply queued signals before producing more.
        return;
      }
      if self.provably_exhausted() {
        self.complete();
        return;
      }
      if !self.demand.has_demand() {
        return;
      }
      match self.pull_out(self.ops.len()) {
        Pulled::Item(item) => {
          self.demand.consume_one();
          self.emit(item);
        }
        Pulled::Pending => {
          self.issue_requests();
          return;
        }
        Pulled::Finished => {
          self.complete();
          return;
        }
        Pulled::Failed { error, origin } => {
          self.fail(origin, error);
          return;
        }
      }
    }
  }

  fn has_pending_events(&self) -> bool {
    self.cell.upgrade().is_some_and(|cell| cell.has_pending())
  }

  fn provably_exhausted(&self) -> bool {
    if !self.started {
      return false;
    }
    let upstream_done = match &self.upstream {
      UpstreamState::Iterable {
        lookahead, done, ..
      } => *done && lookahead.is_none(),
      UpstreamState::Supplied { link, .. } | UpstreamState::Entry { link } => {
        link.done && link.buffered.is_empty()
      }
      UpstreamState::Empty { done } => *done,
      UpstreamState::Failed { .. } => false,
    };
    upstream_done
      && self.ops.iter().all(|op| match op {
        OpState::FlatMap { inner, .. } => inner.is_none(),
        OpState::FlatMapIterable { inner, .. } => inner.is_none(),
        _ => true,
      })
  }

  fn pull_out(&mut self, upto: usize) -> Pulled {
    if upto == 0 {
      return self.pull_source();
    }
    let idx = upto - 1;
    enum Kind {
      Map(MapFn),
      Filter(FilterFn),
      Peek(PeekFn),
      Pass,
      Take(u64),
      Skip,
      FlatIter(FlatMapIterFn),
      FlatPub(FlatMapFn),
    }
    let kind = match &self.ops[idx] {
      OpState::Map(f) => Kind::Map(Arc::clone(f)),
      OpState::Filter(p) => Kind::Filter(Arc::clone(p)),
      OpState::Peek(f) => Kind::Peek(Arc::clone(f)),
      OpState::OnError { .. } | OpState::OnTerminate { .. } => Kind::Pass,
      OpState::Take { remaining } => Kind::Take(*remaining),
      OpState::Skip { .. } => Kind::Skip,
      OpState::FlatMapIterable { f, .. } => Kind::FlatIter(Arc::clone(f)),
      OpState::FlatMap { f, .. } => Kind::FlatPub(Arc::clone(f)),
    };
    match kind {
      Kind::Pass => self.pull_out(idx),
      Kind::Map(f) => match self.pull_out(idx) {
        Pulled::Item(item) => match f(item) {
          Ok(mapped) => Pulled::Item(mapped),
          Err(e) => Pulled::Failed {
            error: StreamError::user_function("map", e),
            origin: idx + 1,
          },
        },
        other => other,
      },
      Kind::Filter(predicate) => loop {
        match self.pull_out(idx) {
          Pulled::Item(item) => match predicate(&item) {
            Ok(true) => return Pulled::Item(item),
            Ok(false) => continue,
            Err(e) => {
              return Pulled::Failed {
                error: StreamError::user_function("filter", e),
                origin: idx + 1,
              };
            }
          },
          other => return other,
        }
      },
      Kind::Peek(f) => match self.pull_out(idx) {
        Pulled::Item(item) => match f(&item) {
          Ok(()) => Pulled::Item(item),
          Err(e) => Pulled::Failed {
            error: StreamError::user_function("peek", e),
            origin: idx + 1,
          },
        },
        other => other,
      },
      Kind::Take(remaining) => {
        if remaining == 0 {
          return Pulled::Finished;
        }
        match self.pull_out(idx) {
          Pulled::Item(item) => {
            if let OpState::Take { remaining } = &mut self.ops[idx] {
              *remaining -= 1;
            }
            Pulled::Item(item)
          }
          other => other,
        }
      }
      Kind::Skip => loop {
        let remaining = match &self.ops[idx] {
          OpState::Skip { remaining } => *remaining,
          _ => 0,
        };
        match self.pull_out(idx) {
          Pulled::Item(item) => {
            if remaining == 0 {
              return Pulled::Item(item);
            }
            if let OpState::Skip { remaining } = &mut self.ops[idx] {
              *remaining -= 1;
            }
          }
          other => return other,
        }
      },
      Kind::FlatIter(f) => loop {
        enum IterStep {
          Emit(AnyItem),
          Exhausted,
          NoInner,
        }
        let step = match &mut self.ops[idx] {
          OpState::FlatMapIterable { inner, .. } => match inner.as_mut() {
            Some(iter) => match iter.next() {
              Some(item) => IterStep::Emit(item),
              None => IterStep::Exhausted,
            },
            None => IterStep::NoInner,
          },
          _ => IterStep::NoInner,
        };
        match step {
          IterStep::Emit(item) => return Pulled::Item(item),
          IterStep::Exhausted => {
            if let OpState::FlatMapIterable { inner, .. } = &mut self.ops[idx] {
              *inner = None;
            }
          }
          IterStep::NoInner => match self.pull_out(idx) {
            Pulled::Item(item) => match f(item) {
              Ok(iter) => {
                if let OpState::FlatMapIterable { inner, .. } = &mut self.ops[idx] {
                  *inner = Some(iter);
                }
              }
              Err(e) => {
                return Pulled::Failed {
                  error: StreamError::user_function("flat_map_iterable", e),
                  origin: idx + 1,
                };
              }
            },
            other => return other,
          },
        }
      },
      Kind::FlatPub(f) => loop {
        enum InnerStep {
          Emit(AnyItem),
          Exhausted,
          Starved,
          NoInner,
        }
        let step = match &mut self.ops[idx] {
          OpState::FlatMap { inner, .. } => match inner.as_mut() {
            Some(link) => {
              if let Some(item) = link.buffered.pop_front() {
                InnerStep::Emit(item)
              } else if link.done {
                InnerStep::Exhausted
              } else {
                InnerStep::Starved
              }
            }
            None => InnerStep::NoInner,
          },
          _ => InnerStep::NoInner,
        };
        match step {
          InnerStep::Emit(item) => return Pulled::Item(item),
          InnerStep::Exhausted => {
            if let OpState::FlatMap { inner, .. } = &mut self.ops[idx] {
              *inner = None;
            }
            continue;
          }
          InnerStep::Starved => {
            self.want_inner.push(idx);
            return Pulled::Pending;
          }
          InnerStep::NoInner => match self.pull_out(idx) {
            Pulled::Item(item) => match f(item) {
              Ok(graph) => {
                if let Err(error) = self.start_inner(idx, graph) {
                  return Pulled::Failed {
                    error,
                    origin: idx + 1,
                  };
                }
              }
              Err(e) => {
                return Pulled::Failed {
                  error: StreamError::user_function("flat_map", e),
                  origin: idx + 1,
                };
              }
            },
            other => return other,
          },
        }
      },
    }
  }

  fn pull_source(&mut self) -> Pulled {
    match &mut self.upstream {
      UpstreamState::Iterable {
        iter,
        lookahead,
        done,
      } => match lookahead.take() {
        Some(item) => {
          match iter.next() {
            Some(next) => *lookahead = Some(next),
            None => *done = true,
          }
          Pulled::Item(item)
        }
        None => {
          if *done {
            Pulled::Finished
          } else {
            Pulled::Pending
          }
        }
      },
      UpstreamState::Supplied { link, .. } | UpstreamState::Entry { link } => {
        if let Some(item) = link.buffered.pop_front() {
          Pulled::Item(item)
        } else if link.done {
          Pulled::Finished
        } else {
          self.want_upstream = true;
          Pulled::Pending
        }
      }
      UpstreamState::Empty { done } => {
        if *done {
          Pulled::Finished
        } else {
          Pulled::Pending
        }
      }
      UpstreamState::Failed { .. } => Pulled::Pending,
    }
  }

  fn start_inner(&mut self, idx: usize, graph: crate::graph::Graph) -> Result<(), StreamError> {
    let publisher = super::materialize_publisher(graph).map_err(|e| {
      StreamError::new(
        StreamErrorKind::UserFunction,
        "flat_map",
        format!("inner graph cannot be materialized: {e}"),
      )
    })?;
    if let OpState::FlatMap { inner, .. } = &mut self.ops[idx] {
      *inner = Some(Link::new());
    }
    let Some(cell) = self.cell.upgrade() else {
      return Ok(());
    };
    publisher.subscribe(Arc::new(InnerTap { cell, op: idx }));
    Ok(())
  }

  fn issue_requests(&mut self) {
    let unbounded = self.demand.is_unbounded();
    if self.want_upstream {
      self.want_upstream = false;
      if let Some(link) = self.upstream_link() {
        if let Some(subscription) = link.subscription.clone() {
          if unbounded {
            if !link.requested.is_unbounded() {
              link.requested.make_unbounded();
              subscription.request(u64::MAX);
            }
          } else if !link.requested.has_demand() {
            let _ = link.requested.add(1, "upstream");
            subscription.request(1);
          }
        }
      }
    }
    let wants = std::mem::take(&mut self.want_inner);
    for idx in wants {
      if let Some(OpState::FlatMap {
        inner: Some(link), ..
      }) = self.ops.get_mut(idx)
      {
        if let Some(subscription) = link.subscription.clone() {
          if unbounded {
            if !link.requested.is_unbounded() {
              link.requested.make_unbounded();
              subscription.request(u64::MAX);
            }
          } else if !link.requested.has_demand() {
            let _ = link.requested.add(1, "flat_map");
            subscription.request(1);
          }
        }
      }
    }
  }

  fn emit(&mut self, item: AnyItem) {
    enum Delivery {
      Deliver(Arc<dyn Subscriber<AnyItem>>),
      Accumulate(CollectAccumulate, Option<AnyItem>),
      FirstHit,
      Drop,
    }
    let delivery = match &mut self.sink {
      SinkState::External { subscriber, .. } => match subscriber {
        Some(subscriber) => Delivery::Deliver(Arc::clone(subscriber)),
        None => Delivery::Drop,
      },
      SinkState::Collect {
        acc, accumulate, ..
      } => Delivery::Accumulate(Arc::clone(accumulate), acc.take()),
      SinkState::First { .. } => Delivery::FirstHit,
      SinkState::Ignore { .. } | SinkState::CancelNow { .. } | SinkState::Detached => {
        Delivery::Drop
      }
    };
    match delivery {
      Delivery::Deliver(subscriber) => subscriber.on_next(item),
      Delivery::Accumulate(accumulate, current) => {
        let origin = self.ops.len();
        match current {
          Some(current) => match accumulate(current, item) {
            Ok(next) => {
              if let SinkState::Collect { acc, .. } = &mut self.sink {
                *acc = Some(next);
              }
            }
            Err(e) => self.fail(origin, StreamError::user_function("collect", e)),
          },
          None => self.fail(origin, StreamError::internal("collect", "accumulator missing")),
        }
      }
      Delivery::FirstHit => {
        if let SinkState::First { completion } =
          std::mem::replace(&mut self.sink, SinkState::Detached)
        {
          completion.resolve(Ok(any_item(FirstResult(Some(item)))));
        }
        self.terminalize_cancel();
      }
      Delivery::Drop => {}
    }
  }

  // ---------------------------------------------------------------------
  // Terminal transitions
  // ---------------------------------------------------------------------

  fn complete(&mut self) {
    if self.is_terminal() {
      return;
    }
    debug!(pipeline = self.label, "pipeline completed");
    self.state = PipeState::Completed;
    self.fire_terminate_hooks(false);
    match std::mem::replace(&mut self.sink, SinkState::Detached) {
      SinkState::External {
        subscriber,
        completion,
      } => {
        if let Some(subscriber) = subscriber {
          subscriber.on_complete();
        }
        if let Some(completion) = completion {
          completion.resolve(Ok(any_item(())));
        }
      }
      SinkState::Collect {
        acc,
        finish,
        completion,
        ..
      } => {
        let result = match acc {
          Some(acc) => finish(acc).map_err(|e| StreamError::user_function("collect", e)),
          None => Err(StreamError::internal("collect", "accumulator missing")),
        };
        completion.resolve(result);
      }
      SinkState::First { completion } => {
        completion.resolve(Ok(any_item(FirstResult(None))));
      }
      SinkState::Ignore { completion } | SinkState::CancelNow { completion } => {
        completion.resolve(Ok(any_item(())));
      }
      SinkState::Detached => {}
    }
    self.release();
  }

  fn fail(&mut self, origin: usize, error: StreamError) {
    if self.is_terminal() {
      return;
    }
    if error.kind() == StreamErrorKind::ProtocolViolation {
      warn!(pipeline = self.label, error = %error, "protocol violation");
    } else {
      debug!(pipeline = self.label, error = %error, "pipeline failed");
    }
    self.state = PipeState::Errored;
    self.fire_error_hooks(origin, &error);
    self.fire_terminate_hooks(false);
    match std::mem::replace(&mut self.sink, SinkState::Detached) {
      SinkState::External {
        subscriber,
        completion,
      } => {
        match subscriber {
          Some(subscriber) => subscriber.on_error(error.clone()),
          None => self.pending_failure = Some(error.clone()),
        }
        if let Some(completion) = completion {
          completion.resolve(Err(error));
        }
      }
      SinkState::Collect { completion, .. }
      | SinkState::First { completion }
      | SinkState::Ignore { completion }
      | SinkState::CancelNow { completion } => {
        // A partial accumulation is discarded with the taken sink.
        completion.resolve(Err(error));
      }
      SinkState::Detached => {}
    }
    self.release();
  }

  fn terminalize_cancel(&mut self) {
    if self.is_terminal() {
      return;
    }
    self.state = PipeState::Cancelled;
    self.fire_terminate_hooks(true);
    // Cancellation is not acknowledged with a terminal signal; the sink is
    // simply detached.
    let _ = std::mem::replace(&mut self.sink, SinkState::Detached);
    self.release();
  }

  fn fire_error_hooks(&mut self, origin: usize, error: &StreamError) {
    for idx in origin..self.ops.len() {
      if let OpState::OnError { hook } = &self.ops[idx] {
        let hook = Arc::clone(hook);
        hook(error);
      }
    }
  }

  fn fire_terminate_hooks(&mut self, reverse: bool) {
    let len = self.ops.len();
    let order: Vec<usize> = if reverse {
      (0..len).rev().collect()
    } else {
      (0..len).collect()
    };
    for idx in order {
      if let OpState::OnTerminate { hook, fired } = &mut self.ops[idx] {
        if !*fired {
          *fired = true;
          let hook = Arc::clone(hook);
          hook();
        }
      }
    }
  }

  fn release(&mut self) {
    match &mut self.upstream {
      UpstreamState::Supplied { link, .. } | UpstreamState::Entry { link } => link.release(),
      UpstreamState::Iterable {
        lookahead, done, ..
      } => {
        *lookahead = None;
        *done = true;
      }
      _ => {}
    }
    for op in &mut self.ops {
      match op {
        OpState::FlatMap { inner, .. } => {
          if let Some(mut link) = inner.take() {
            link.release();
          }
        }
        OpState::FlatMapIterable { inner, .. } => *inner = None,
        _ => {}
      }
    }
    self.want_upstream = false;
    self.want_inner.clear();
    self.demand.clear();
  }
}
